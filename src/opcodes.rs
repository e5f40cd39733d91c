//! JVM opcode numbers, control-flow classification and operand stack rules.

pub(crate) const NOP: u8 = 0x00;
pub(crate) const ACONST_NULL: u8 = 0x01;
pub(crate) const ICONST_M1: u8 = 0x02;
#[cfg(test)]
pub(crate) const ICONST_0: u8 = 0x03;
#[cfg(test)]
pub(crate) const ICONST_1: u8 = 0x04;
pub(crate) const ICONST_5: u8 = 0x08;
pub(crate) const LCONST_0: u8 = 0x09;
pub(crate) const LCONST_1: u8 = 0x0a;
pub(crate) const FCONST_0: u8 = 0x0b;
pub(crate) const FCONST_2: u8 = 0x0d;
pub(crate) const DCONST_0: u8 = 0x0e;
pub(crate) const DCONST_1: u8 = 0x0f;
pub(crate) const BIPUSH: u8 = 0x10;
pub(crate) const SIPUSH: u8 = 0x11;
pub(crate) const LDC: u8 = 0x12;
pub(crate) const LDC_W: u8 = 0x13;
pub(crate) const LDC2_W: u8 = 0x14;
pub(crate) const ILOAD: u8 = 0x15;
pub(crate) const LLOAD: u8 = 0x16;
pub(crate) const FLOAD: u8 = 0x17;
pub(crate) const DLOAD: u8 = 0x18;
pub(crate) const ALOAD: u8 = 0x19;
pub(crate) const ILOAD_0: u8 = 0x1a;
pub(crate) const ALOAD_0: u8 = 0x2a;
pub(crate) const ALOAD_3: u8 = 0x2d;
pub(crate) const IALOAD: u8 = 0x2e;
pub(crate) const LALOAD: u8 = 0x2f;
pub(crate) const FALOAD: u8 = 0x30;
pub(crate) const DALOAD: u8 = 0x31;
pub(crate) const AALOAD: u8 = 0x32;
pub(crate) const BALOAD: u8 = 0x33;
pub(crate) const CALOAD: u8 = 0x34;
pub(crate) const SALOAD: u8 = 0x35;
pub(crate) const ISTORE: u8 = 0x36;
pub(crate) const ASTORE: u8 = 0x3a;
pub(crate) const ISTORE_0: u8 = 0x3b;
pub(crate) const ASTORE_3: u8 = 0x4e;
pub(crate) const IASTORE: u8 = 0x4f;
pub(crate) const SASTORE: u8 = 0x56;
pub(crate) const POP: u8 = 0x57;
pub(crate) const POP2: u8 = 0x58;
pub(crate) const DUP: u8 = 0x59;
pub(crate) const DUP_X1: u8 = 0x5a;
pub(crate) const DUP_X2: u8 = 0x5b;
pub(crate) const DUP2: u8 = 0x5c;
pub(crate) const DUP2_X1: u8 = 0x5d;
pub(crate) const DUP2_X2: u8 = 0x5e;
pub(crate) const SWAP: u8 = 0x5f;
pub(crate) const IADD: u8 = 0x60;
pub(crate) const DREM: u8 = 0x73;
pub(crate) const INEG: u8 = 0x74;
pub(crate) const LNEG: u8 = 0x75;
pub(crate) const FNEG: u8 = 0x76;
pub(crate) const DNEG: u8 = 0x77;
pub(crate) const ISHL: u8 = 0x78;
pub(crate) const LSHL: u8 = 0x79;
pub(crate) const ISHR: u8 = 0x7a;
pub(crate) const LSHR: u8 = 0x7b;
pub(crate) const IUSHR: u8 = 0x7c;
pub(crate) const LUSHR: u8 = 0x7d;
pub(crate) const IAND: u8 = 0x7e;
pub(crate) const LAND: u8 = 0x7f;
pub(crate) const IOR: u8 = 0x80;
pub(crate) const LOR: u8 = 0x81;
pub(crate) const IXOR: u8 = 0x82;
pub(crate) const LXOR: u8 = 0x83;
pub(crate) const IINC: u8 = 0x84;
pub(crate) const I2L: u8 = 0x85;
pub(crate) const I2F: u8 = 0x86;
pub(crate) const I2D: u8 = 0x87;
pub(crate) const L2I: u8 = 0x88;
pub(crate) const L2F: u8 = 0x89;
pub(crate) const L2D: u8 = 0x8a;
pub(crate) const F2I: u8 = 0x8b;
pub(crate) const F2L: u8 = 0x8c;
pub(crate) const F2D: u8 = 0x8d;
pub(crate) const D2I: u8 = 0x8e;
pub(crate) const D2L: u8 = 0x8f;
pub(crate) const D2F: u8 = 0x90;
pub(crate) const I2B: u8 = 0x91;
pub(crate) const I2C: u8 = 0x92;
pub(crate) const I2S: u8 = 0x93;
pub(crate) const LCMP: u8 = 0x94;
pub(crate) const DCMPG: u8 = 0x98;
pub(crate) const IFEQ: u8 = 0x99;
pub(crate) const IFLT: u8 = 0x9b;
pub(crate) const IFGE: u8 = 0x9c;
pub(crate) const IFGT: u8 = 0x9d;
pub(crate) const IFLE: u8 = 0x9e;
pub(crate) const IF_ICMPEQ: u8 = 0x9f;
pub(crate) const IF_ICMPLT: u8 = 0xa1;
pub(crate) const IF_ICMPGE: u8 = 0xa2;
pub(crate) const IF_ICMPGT: u8 = 0xa3;
pub(crate) const IF_ICMPLE: u8 = 0xa4;
pub(crate) const IF_ACMPNE: u8 = 0xa6;
pub(crate) const GOTO: u8 = 0xa7;
pub(crate) const JSR: u8 = 0xa8;
pub(crate) const RET: u8 = 0xa9;
pub(crate) const TABLESWITCH: u8 = 0xaa;
pub(crate) const LOOKUPSWITCH: u8 = 0xab;
pub(crate) const IRETURN: u8 = 0xac;
pub(crate) const ARETURN: u8 = 0xb0;
pub(crate) const RETURN: u8 = 0xb1;
pub(crate) const GETSTATIC: u8 = 0xb2;
pub(crate) const PUTSTATIC: u8 = 0xb3;
pub(crate) const GETFIELD: u8 = 0xb4;
pub(crate) const PUTFIELD: u8 = 0xb5;
pub(crate) const INVOKEVIRTUAL: u8 = 0xb6;
pub(crate) const INVOKESPECIAL: u8 = 0xb7;
pub(crate) const INVOKESTATIC: u8 = 0xb8;
pub(crate) const INVOKEINTERFACE: u8 = 0xb9;
pub(crate) const INVOKEDYNAMIC: u8 = 0xba;
pub(crate) const NEW: u8 = 0xbb;
pub(crate) const NEWARRAY: u8 = 0xbc;
pub(crate) const ANEWARRAY: u8 = 0xbd;
pub(crate) const ARRAYLENGTH: u8 = 0xbe;
pub(crate) const ATHROW: u8 = 0xbf;
pub(crate) const CHECKCAST: u8 = 0xc0;
pub(crate) const INSTANCEOF: u8 = 0xc1;
pub(crate) const MONITORENTER: u8 = 0xc2;
pub(crate) const MONITOREXIT: u8 = 0xc3;
#[cfg(test)]
pub(crate) const WIDE: u8 = 0xc4;
pub(crate) const MULTIANEWARRAY: u8 = 0xc5;
pub(crate) const IFNULL: u8 = 0xc6;
pub(crate) const IFNONNULL: u8 = 0xc7;
pub(crate) const GOTO_W: u8 = 0xc8;
pub(crate) const JSR_W: u8 = 0xc9;

pub(crate) fn is_return(opcode: u8) -> bool {
    (IRETURN..=RETURN).contains(&opcode)
}

/// Opcodes after which control never falls through and no successor block exists.
pub(crate) fn is_exit_opcode(opcode: u8) -> bool {
    is_return(opcode) || opcode == ATHROW || opcode == RET
}

pub(crate) fn is_conditional_branch(opcode: u8) -> bool {
    matches!(opcode, IFEQ..=IF_ACMPNE | IFNULL | IFNONNULL)
}

pub(crate) fn is_unconditional_branch(opcode: u8) -> bool {
    matches!(opcode, GOTO | JSR | GOTO_W | JSR_W)
}

pub(crate) fn is_switch(opcode: u8) -> bool {
    matches!(opcode, TABLESWITCH | LOOKUPSWITCH)
}

/// Compares the top of stack against zero or null.
pub(crate) fn is_unary_branch(opcode: u8) -> bool {
    matches!(opcode, IFEQ..=IFLE | IFNULL | IFNONNULL)
}

pub(crate) fn is_value_compare(opcode: u8) -> bool {
    matches!(opcode, LCMP..=DCMPG)
}

pub(crate) fn is_invoke(opcode: u8) -> bool {
    matches!(opcode, INVOKEVIRTUAL..=INVOKEDYNAMIC)
}

/// Pushes an operand-free or inline constant.
/// Value category of a stack entry as produced by an opcode rule.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Produced {
    Int,
    Long,
    Float,
    Double,
    Reference,
    Null,
}

/// Operand stack transfer rule for one opcode.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum StackRule {
    /// Pops a fixed number of values and optionally pushes one.
    Fixed { pops: u8, push: Option<Produced> },
    LoadLocal(Produced),
    StoreLocal,
    ArrayLoad(Produced),
    ReferenceArrayLoad,
    Constant,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
    Increment,
    GetField { receiver: bool },
    PutField { receiver: bool },
    Invoke { receiver: bool },
    New,
    NewArray,
    ReferenceArray,
    MultiArray,
    CheckCast,
    Jsr,
    Ret,
}

/// Operand stack rule for an opcode, or `None` when no rule is known.
pub(crate) fn stack_rule(opcode: u8) -> Option<StackRule> {
    use Produced::*;
    use StackRule::*;

    let fixed = |pops: u8, push: Option<Produced>| Some(Fixed { pops, push });
    match opcode {
        NOP => fixed(0, None),
        ACONST_NULL => fixed(0, Some(Null)),
        ICONST_M1..=ICONST_5 | BIPUSH | SIPUSH => fixed(0, Some(Int)),
        LCONST_0 | LCONST_1 => fixed(0, Some(Long)),
        FCONST_0..=FCONST_2 => fixed(0, Some(Float)),
        DCONST_0 | DCONST_1 => fixed(0, Some(Double)),
        LDC | LDC_W | LDC2_W => Some(Constant),
        ILOAD | 0x1a..=0x1d => Some(LoadLocal(Int)),
        LLOAD | 0x1e..=0x21 => Some(LoadLocal(Long)),
        FLOAD | 0x22..=0x25 => Some(LoadLocal(Float)),
        DLOAD | 0x26..=0x29 => Some(LoadLocal(Double)),
        ALOAD | ALOAD_0..=ALOAD_3 => Some(LoadLocal(Reference)),
        IALOAD | BALOAD | CALOAD | SALOAD => Some(ArrayLoad(Int)),
        LALOAD => Some(ArrayLoad(Long)),
        FALOAD => Some(ArrayLoad(Float)),
        DALOAD => Some(ArrayLoad(Double)),
        AALOAD => Some(ReferenceArrayLoad),
        ISTORE..=ASTORE | ISTORE_0..=ASTORE_3 => Some(StoreLocal),
        IASTORE..=SASTORE => fixed(3, None),
        POP => fixed(1, None),
        POP2 => Some(Pop2),
        DUP => Some(Dup),
        DUP_X1 => Some(DupX1),
        DUP_X2 => Some(DupX2),
        DUP2 => Some(Dup2),
        DUP2_X1 => Some(Dup2X1),
        DUP2_X2 => Some(Dup2X2),
        SWAP => Some(Swap),
        // Binary arithmetic cycles through int, long, float, double.
        IADD..=DREM => fixed(2, Some(arithmetic_kind(opcode))),
        IAND | IOR | IXOR => fixed(2, Some(Int)),
        LAND | LOR | LXOR => fixed(2, Some(Long)),
        ISHL | ISHR | IUSHR => fixed(2, Some(Int)),
        LSHL | LSHR | LUSHR => fixed(2, Some(Long)),
        INEG => fixed(1, Some(Int)),
        LNEG => fixed(1, Some(Long)),
        FNEG => fixed(1, Some(Float)),
        DNEG => fixed(1, Some(Double)),
        IINC => Some(Increment),
        I2L | F2L | D2L => fixed(1, Some(Long)),
        I2F | L2F | D2F => fixed(1, Some(Float)),
        I2D | L2D | F2D => fixed(1, Some(Double)),
        L2I | F2I | D2I | I2B | I2C | I2S => fixed(1, Some(Int)),
        LCMP..=DCMPG => fixed(2, Some(Int)),
        IFEQ..=IFLE | IFNULL | IFNONNULL => fixed(1, None),
        IF_ICMPEQ..=IF_ACMPNE => fixed(2, None),
        GOTO | GOTO_W => fixed(0, None),
        JSR | JSR_W => Some(Jsr),
        RET => Some(Ret),
        TABLESWITCH | LOOKUPSWITCH => fixed(1, None),
        IRETURN..=ARETURN => fixed(1, None),
        RETURN => fixed(0, None),
        GETSTATIC => Some(GetField { receiver: false }),
        GETFIELD => Some(GetField { receiver: true }),
        PUTSTATIC => Some(PutField { receiver: false }),
        PUTFIELD => Some(PutField { receiver: true }),
        INVOKEVIRTUAL | INVOKESPECIAL | INVOKEINTERFACE => Some(Invoke { receiver: true }),
        INVOKESTATIC | INVOKEDYNAMIC => Some(Invoke { receiver: false }),
        NEW => Some(New),
        NEWARRAY => Some(NewArray),
        ANEWARRAY => Some(ReferenceArray),
        ARRAYLENGTH => fixed(1, Some(Int)),
        ATHROW => fixed(1, None),
        CHECKCAST => Some(CheckCast),
        INSTANCEOF => fixed(1, Some(Int)),
        MONITORENTER | MONITOREXIT => fixed(1, None),
        MULTIANEWARRAY => Some(MultiArray),
        _ => None,
    }
}

fn arithmetic_kind(opcode: u8) -> Produced {
    match (opcode - IADD) % 4 {
        0 => Produced::Int,
        1 => Produced::Long,
        2 => Produced::Float,
        _ => Produced::Double,
    }
}
