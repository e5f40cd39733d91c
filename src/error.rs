use thiserror::Error;

/// Failures raised by the analysis core.
///
/// Every variant is scoped to one method or one diff file; callers record the
/// failure on that unit and keep analysing the rest of the artifact.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AnalysisError {
    /// The method body cannot be turned into a control flow graph.
    #[error("malformed bytecode at offset {offset}: {reason}")]
    MalformedBytecode { offset: u32, reason: String },

    /// No operand transfer rule exists for the opcode.
    #[error("unsupported opcode 0x{opcode:02x} at offset {offset}")]
    UnsupportedOpcode { opcode: u8, offset: u32 },

    /// A diff section could not be parsed or does not fit its source file.
    #[error("malformed diff at line {line}: {reason}")]
    MalformedDiff { line: usize, reason: String },

    /// A fixed-point iteration hit its cap.
    #[error("{analysis} did not converge within {iterations} iterations")]
    Convergence {
        analysis: &'static str,
        iterations: usize,
    },
}

impl AnalysisError {
    pub(crate) fn malformed_bytecode(offset: u32, reason: impl Into<String>) -> Self {
        Self::MalformedBytecode {
            offset,
            reason: reason.into(),
        }
    }

    pub(crate) fn malformed_diff(line: usize, reason: impl Into<String>) -> Self {
        Self::MalformedDiff {
            line,
            reason: reason.into(),
        }
    }
}

/// Result alias used across the analysis core.
pub type AnalysisResult<T> = Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_location() {
        let error = AnalysisError::UnsupportedOpcode {
            opcode: 0xca,
            offset: 12,
        };
        assert_eq!("unsupported opcode 0xca at offset 12", error.to_string());

        let error = AnalysisError::Convergence {
            analysis: "dominators",
            iterations: 64,
        };
        assert_eq!(
            "dominators did not converge within 64 iterations",
            error.to_string()
        );
    }
}
