//! Well-known `public static final` constants of the JDK.
//!
//! javac inlines these at compile time, so a source reference like
//! `Integer.MAX_VALUE` shows up in bytecode as a plain constant push.

use std::collections::BTreeMap;

use crate::ir::ConstantValue;

/// Fields under these packages are platform dependent and never inlined.
const PLATFORM_PREFIXES: &[&str] = &["java.io."];

/// Table of well-known constants keyed by `qualified.Owner#NAME`.
///
/// Zero-argument methods with a fixed result use the `Owner#name()` form.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LibraryConstants {
    entries: BTreeMap<String, ConstantValue>,
}

impl LibraryConstants {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in JDK table.
    pub fn builtin() -> Self {
        use ConstantValue::*;

        let mut table = Self::new();
        let ints: &[(&str, i32)] = &[
            ("java.lang.Integer#MAX_VALUE", i32::MAX),
            ("java.lang.Integer#MIN_VALUE", i32::MIN),
            ("java.lang.Integer#SIZE", 32),
            ("java.lang.Integer#BYTES", 4),
            ("java.lang.Long#SIZE", 64),
            ("java.lang.Long#BYTES", 8),
            ("java.lang.Short#SIZE", 16),
            ("java.lang.Short#BYTES", 2),
            ("java.lang.Byte#SIZE", 8),
            ("java.lang.Byte#BYTES", 1),
            ("java.lang.Character#SIZE", 16),
            ("java.lang.Character#BYTES", 2),
            ("java.lang.Character#MIN_RADIX", 2),
            ("java.lang.Character#MAX_RADIX", 36),
            ("java.lang.Character#MIN_CODE_POINT", 0),
            ("java.lang.Character#MAX_CODE_POINT", 0x10ffff),
            ("java.lang.Character#MIN_SUPPLEMENTARY_CODE_POINT", 0x10000),
            ("java.lang.Float#SIZE", 32),
            ("java.lang.Float#BYTES", 4),
            ("java.lang.Float#MAX_EXPONENT", 127),
            ("java.lang.Float#MIN_EXPONENT", -126),
            ("java.lang.Double#SIZE", 64),
            ("java.lang.Double#BYTES", 8),
            ("java.lang.Double#MAX_EXPONENT", 1023),
            ("java.lang.Double#MIN_EXPONENT", -1022),
            ("java.lang.reflect.Modifier#PUBLIC", 0x0001),
            ("java.lang.reflect.Modifier#PRIVATE", 0x0002),
            ("java.lang.reflect.Modifier#PROTECTED", 0x0004),
            ("java.lang.reflect.Modifier#STATIC", 0x0008),
            ("java.lang.reflect.Modifier#FINAL", 0x0010),
            ("java.util.regex.Pattern#UNIX_LINES", 0x01),
            ("java.util.regex.Pattern#CASE_INSENSITIVE", 0x02),
            ("java.util.regex.Pattern#COMMENTS", 0x04),
            ("java.util.regex.Pattern#MULTILINE", 0x08),
            ("java.util.regex.Pattern#LITERAL", 0x10),
            ("java.util.regex.Pattern#DOTALL", 0x20),
            ("java.util.Calendar#YEAR", 1),
            ("java.util.Calendar#MONTH", 2),
            ("java.util.Calendar#DAY_OF_MONTH", 5),
            ("java.util.Calendar#HOUR_OF_DAY", 11),
            ("java.util.Calendar#MINUTE", 12),
            ("java.util.Calendar#SECOND", 13),
            ("java.util.Calendar#MILLISECOND", 14),
            ("java.net.HttpURLConnection#HTTP_OK", 200),
            ("java.net.HttpURLConnection#HTTP_BAD_REQUEST", 400),
            ("java.net.HttpURLConnection#HTTP_UNAUTHORIZED", 401),
            ("java.net.HttpURLConnection#HTTP_FORBIDDEN", 403),
            ("java.net.HttpURLConnection#HTTP_NOT_FOUND", 404),
            ("java.net.HttpURLConnection#HTTP_INTERNAL_ERROR", 500),
        ];
        for (key, value) in ints {
            table.insert(*key, Int(*value));
        }

        table.insert("java.lang.Long#MAX_VALUE", Long(i64::MAX));
        table.insert("java.lang.Long#MIN_VALUE", Long(i64::MIN));
        table.insert("java.lang.Short#MAX_VALUE", Int(i32::from(i16::MAX)));
        table.insert("java.lang.Short#MIN_VALUE", Int(i32::from(i16::MIN)));
        table.insert("java.lang.Byte#MAX_VALUE", Int(i32::from(i8::MAX)));
        table.insert("java.lang.Byte#MIN_VALUE", Int(i32::from(i8::MIN)));
        table.insert("java.lang.Character#MIN_VALUE", Char(u16::MIN));
        table.insert("java.lang.Character#MAX_VALUE", Char(u16::MAX));
        table.insert("java.lang.Character#MIN_HIGH_SURROGATE", Char(0xd800));
        table.insert("java.lang.Character#MAX_HIGH_SURROGATE", Char(0xdbff));
        table.insert("java.lang.Character#MIN_LOW_SURROGATE", Char(0xdc00));
        table.insert("java.lang.Character#MAX_LOW_SURROGATE", Char(0xdfff));

        table.insert("java.lang.Float#MAX_VALUE", Float(f32::MAX));
        table.insert("java.lang.Float#MIN_VALUE", Float(f32::from_bits(1)));
        table.insert("java.lang.Float#MIN_NORMAL", Float(f32::MIN_POSITIVE));
        table.insert("java.lang.Float#POSITIVE_INFINITY", Float(f32::INFINITY));
        table.insert("java.lang.Float#NEGATIVE_INFINITY", Float(f32::NEG_INFINITY));
        table.insert("java.lang.Float#NaN", Float(f32::NAN));
        table.insert("java.lang.Double#MAX_VALUE", Double(f64::MAX));
        table.insert("java.lang.Double#MIN_VALUE", Double(f64::from_bits(1)));
        table.insert("java.lang.Double#MIN_NORMAL", Double(f64::MIN_POSITIVE));
        table.insert("java.lang.Double#POSITIVE_INFINITY", Double(f64::INFINITY));
        table.insert("java.lang.Double#NEGATIVE_INFINITY", Double(f64::NEG_INFINITY));
        table.insert("java.lang.Double#NaN", Double(f64::NAN));
        for owner in ["java.lang.Math", "java.lang.StrictMath"] {
            table.insert(format!("{owner}#PI"), Double(std::f64::consts::PI));
            table.insert(format!("{owner}#E"), Double(std::f64::consts::E));
        }
        table
    }

    pub fn insert(&mut self, key: impl Into<String>, value: ConstantValue) {
        self.entries.insert(key.into(), value);
    }

    pub fn extend(&mut self, entries: impl IntoIterator<Item = (String, ConstantValue)>) {
        self.entries.extend(entries);
    }

    /// Constant for `key`, never for platform dependent owners.
    pub fn get(&self, key: &str) -> Option<&ConstantValue> {
        if PLATFORM_PREFIXES.iter().any(|prefix| key.starts_with(prefix)) {
            return None;
        }
        self.entries.get(key)
    }

    /// Constant for a field of a qualified owner.
    pub fn field(&self, owner: &str, name: &str) -> Option<&ConstantValue> {
        self.get(&format!("{owner}#{name}"))
    }

    /// Constant for a zero-argument method of a qualified owner.
    pub fn invocation(&self, owner: &str, name: &str) -> Option<&ConstantValue> {
        self.get(&format!("{owner}#{name}()"))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_covers_wrapper_limits() {
        let table = LibraryConstants::builtin();
        assert_eq!(
            Some(&ConstantValue::Int(i32::MAX)),
            table.field("java.lang.Integer", "MAX_VALUE")
        );
        assert_eq!(
            Some(&ConstantValue::Long(i64::MIN)),
            table.get("java.lang.Long#MIN_VALUE")
        );
        assert_eq!(
            Some(&ConstantValue::Double(std::f64::consts::PI)),
            table.field("java.lang.Math", "PI")
        );
    }

    #[test]
    fn platform_fields_are_never_constant() {
        let mut table = LibraryConstants::builtin();
        table.insert("java.io.File#separatorChar", ConstantValue::Char(u16::from(b'/')));
        assert_eq!(None, table.field("java.io.File", "separatorChar"));
    }

    #[test]
    fn zero_argument_invocations_use_call_form() {
        let mut table = LibraryConstants::new();
        table.insert("org.example.Limits#max()", ConstantValue::Int(16));
        assert_eq!(
            Some(&ConstantValue::Int(16)),
            table.invocation("org.example.Limits", "max")
        );
        assert_eq!(None, table.field("org.example.Limits", "max"));
    }
}
