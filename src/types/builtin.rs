use super::TypeId;

macro_rules! builtins {
    ($($variant:ident = $name:literal, $bits:literal, $signed:literal, $by_value:literal;)*) => {
        /// Every type the runtime knows about without a type context.
        ///
        /// Ids below [`NUM_PRIMITIVE_BUILTINS`] are complete types on their
        /// own. The ones after it name container families and only appear
        /// as the base of a compound type.
        #[repr(u64)]
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum Builtin {
            $($variant,)*
        }

        const INFO: &[BuiltinInfo] = &[
            $(BuiltinInfo {
                name: $name,
                int_bits: $bits,
                signed: $signed,
                by_value: $by_value,
            },)*
        ];

        const ALL: &[Builtin] = &[$(Builtin::$variant,)*];
    };
}

#[derive(Debug)]
pub struct BuiltinInfo {
    pub name: &'static str,
    /// Width in bits for integer types, zero otherwise.
    pub int_bits: u8,
    pub signed: bool,
    /// Stored directly in a value slot rather than behind a pointer.
    pub by_value: bool,
}

builtins! {
    Error = "error", 0, false, true;
    Void = "void", 0, false, true;
    Nil = "nil", 0, false, true;
    Typespec = "typespec", 0, false, false;
    InternalTlist = "internal_tlist", 0, false, false;
    Bool = "bool", 0, false, true;
    I8 = "i8", 8, true, true;
    Byte = "byte", 8, false, true;
    I32 = "i32", 32, true, true;
    Char = "char", 32, false, true;
    U32 = "u32", 32, false, true;
    Int = "int", 64, true, true;
    Uint = "uint", 64, false, true;
    F32 = "f32", 0, false, true;
    F64 = "float", 0, false, true;
    String = "string", 0, false, false;
    Table = "table", 0, false, false;
    Buffer = "buffer", 0, false, false;
    Ipv4 = "ipv4", 0, false, false;
    Duration = "duration", 0, false, false;
    Size = "size", 0, false, true;
    Datetime = "datetime", 0, false, false;
    Date = "date", 0, false, false;
    Time = "time", 0, false, false;
    Url = "url", 0, false, false;
    Flags = "flags", 0, false, false;
    Sha = "sha", 0, false, false;
    Exception = "exception", 0, false, false;
    Callback = "callback", 0, false, false;
    Ref = "ref", 0, false, true;
    Keyword = "keyword", 0, false, false;
    Vm = "vm", 0, false, false;
    ParseNode = "parse_node", 0, false, false;
    Bit = "bit", 1, false, true;
    BoxBool = "box_bool", 0, false, false;
    BoxI8 = "box_i8", 0, false, false;
    BoxByte = "box_byte", 0, false, false;
    BoxI32 = "box_i32", 0, false, false;
    BoxChar = "box_char", 0, false, false;
    BoxU32 = "box_u32", 0, false, false;
    BoxInt = "box_int", 0, false, false;
    BoxUint = "box_uint", 0, false, false;
    BoxF32 = "box_f32", 0, false, false;
    BoxF64 = "box_float", 0, false, false;
    Http = "http", 0, false, false;
    Parser = "parser", 0, false, false;
    Grammar = "grammar", 0, false, false;
    Terminal = "terminal", 0, false, false;
    Ruleset = "ruleset", 0, false, false;
    GoptParser = "gopt_parser", 0, false, false;
    GoptCommand = "gopt_command", 0, false, false;
    GoptOption = "gopt_option", 0, false, false;
    Mutex = "mutex", 0, false, false;
    RwLock = "rw_lock", 0, false, false;
    Condition = "condition", 0, false, false;
    Stream = "stream", 0, false, false;
    Bytering = "bytering", 0, false, false;
    TextElement = "text_element", 0, false, false;
    BoxProps = "box_props", 0, false, false;
    Theme = "theme", 0, false, false;
    Regex = "regex", 0, false, false;
    Session = "session", 0, false, false;
    SessionState = "session_state", 0, false, false;
    SessionTrigger = "session_trigger", 0, false, false;
    Internal = "internal", 0, false, false;
    VaList = "va_list", 0, false, false;
    NumPrimitiveBuiltins = "<num_primitives>", 0, false, false;
    List = "list", 0, false, false;
    Tuple = "tuple", 0, false, false;
    Dict = "dict", 0, false, false;
    Set = "set", 0, false, false;
    Tree = "tree", 0, false, false;
    Funcdef = "fn", 0, false, false;
    TrueRef = "ref", 0, false, true;
    Generic = "generic", 0, false, false;
}

pub const NUM_PRIMITIVE_BUILTINS: u64 = Builtin::NumPrimitiveBuiltins as u64;
pub const NUM_BUILTINS: u64 = ALL.len() as u64;

impl Builtin {
    pub fn from_id(id: u64) -> Option<Builtin> {
        ALL.get(id as usize).copied()
    }

    pub fn info(self) -> &'static BuiltinInfo {
        &INFO[self as usize]
    }

    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn is_primitive(self) -> bool {
        (self as u64) < NUM_PRIMITIVE_BUILTINS
    }

    pub fn is_int(self) -> bool {
        self.info().int_bits > 1
    }

    pub fn id(self) -> TypeId {
        TypeId(self as u64)
    }
}

/// Result of [`promote`]: the common integer type plus whether values of
/// either side may not survive the conversion.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Promotion {
    pub to: Builtin,
    pub may_wrap: bool,
}

/// The integer type two integer operands meet at, following the builtin
/// ordering `i8 < byte < i32 < char < u32 < int < uint`. `None` when
/// either side is not an integer.
pub fn promote(a: Builtin, b: Builtin) -> Option<Promotion> {
    let in_range = |t: Builtin| (Builtin::I8..=Builtin::Uint).contains(&t);

    if !in_range(a) || !in_range(b) {
        return None;
    }

    let (hi, lo) = if a >= b { (a, b) } else { (b, a) };
    let done = |to, may_wrap| Some(Promotion { to, may_wrap });

    match hi {
        Builtin::Uint => match lo {
            Builtin::Int => done(Builtin::Int, true),
            Builtin::I32 | Builtin::I8 => done(Builtin::Int, false),
            _ => done(Builtin::Uint, false),
        },
        Builtin::U32 | Builtin::Char => match lo {
            Builtin::I32 => done(Builtin::I32, true),
            Builtin::I8 => done(Builtin::I32, false),
            _ => done(Builtin::U32, false),
        },
        Builtin::Byte if lo != Builtin::Byte => done(Builtin::I8, true),
        Builtin::Byte => done(Builtin::Byte, false),
        Builtin::Int => done(Builtin::Int, false),
        Builtin::I32 => done(Builtin::I32, false),
        _ => done(Builtin::I8, false),
    }
}
