//! The kinds of values that flow across a method boundary, and method signatures built from them.

use std::{fmt, iter::Peekable, str::Chars, str::FromStr};
use strum::{EnumCount, EnumIter};
use thiserror::Error;

/// The maximum number of arguments an adapted method may take.
pub const MAX_ADAPTER_ARGS: usize = 255;

/// The size in bytes of a machine word on the target. [Kind::Word] and [Kind::Reference] values
/// are this wide.
pub const WORD_BYTES: usize = 8;

/// The kind of a value passed to, or returned from, a method.
#[derive(Clone, Copy, Debug, EnumCount, EnumIter, Eq, Hash, PartialEq)]
pub enum Kind {
    Byte,
    Boolean,
    Short,
    Char,
    Int,
    Long,
    Float,
    Double,
    /// An untyped machine word.
    Word,
    /// A reference to a heap object: the garbage collector must be told about these.
    Reference,
}

impl Kind {
    /// The width of a value of this kind in bits.
    pub fn bit_width(self) -> u32 {
        match self {
            Kind::Byte | Kind::Boolean => 8,
            Kind::Short | Kind::Char => 16,
            Kind::Int | Kind::Float => 32,
            Kind::Long | Kind::Double => 64,
            Kind::Word | Kind::Reference => WORD_BYTES as u32 * 8,
        }
    }

    /// How many stack slots of `slot_size` bytes does a value of this kind occupy?
    pub fn stack_slots(self, slot_size: usize) -> usize {
        match self {
            Kind::Long | Kind::Double => {
                if slot_size >= 8 {
                    1
                } else {
                    2
                }
            }
            Kind::Word | Kind::Reference => WORD_BYTES.div_ceil(slot_size),
            _ => 1,
        }
    }

    pub fn is_reference(self) -> bool {
        self == Kind::Reference
    }

    /// Is this kind passed in floating point registers?
    pub fn is_float(self) -> bool {
        matches!(self, Kind::Float | Kind::Double)
    }

    /// Is this kind 64 bits wide?
    pub fn is_wide(self) -> bool {
        self.bit_width() == 64
    }

    /// The single-character code used for this kind in method descriptors.
    pub fn descriptor_char(self) -> char {
        match self {
            Kind::Byte => 'B',
            Kind::Boolean => 'Z',
            Kind::Short => 'S',
            Kind::Char => 'C',
            Kind::Int => 'I',
            Kind::Long => 'J',
            Kind::Float => 'F',
            Kind::Double => 'D',
            Kind::Word => 'W',
            Kind::Reference => 'R',
        }
    }

    fn from_descriptor_char(c: char) -> Option<Self> {
        Some(match c {
            'B' => Kind::Byte,
            'Z' => Kind::Boolean,
            'S' => Kind::Short,
            'C' => Kind::Char,
            'I' => Kind::Int,
            'J' => Kind::Long,
            'F' => Kind::Float,
            'D' => Kind::Double,
            'W' => Kind::Word,
            'R' => Kind::Reference,
            _ => return None,
        })
    }
}

/// A failure to decode a method descriptor.
#[derive(Debug, Error, PartialEq)]
pub enum SignatureError {
    #[error("Malformed descriptor '{0}'")]
    Malformed(String),
    #[error("Unknown kind '{0}' in descriptor")]
    UnknownKind(char),
    #[error("Void is only valid as a return kind")]
    VoidArgument,
    #[error("Descriptor has more than {MAX_ADAPTER_ARGS} arguments")]
    TooManyArgs,
}

/// The argument kinds and return kind of a method. Two signatures are the same if their kinds are
/// the same: the names of reference types play no part.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Signature {
    args: Box<[Kind]>,
    /// `None` if the method returns void.
    ret: Option<Kind>,
}

impl Signature {
    pub fn new(args: Vec<Kind>, ret: Option<Kind>) -> Self {
        Self {
            args: args.into_boxed_slice(),
            ret,
        }
    }

    pub fn args(&self) -> &[Kind] {
        &self.args
    }

    pub fn ret(&self) -> Option<Kind> {
        self.ret
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for k in self.args.iter() {
            write!(f, "{}", k.descriptor_char())?;
        }
        write!(f, "){}", self.ret.map(Kind::descriptor_char).unwrap_or('V'))
    }
}

/// Parse a method descriptor such as `(ILjava/lang/Object;[J)V`. Class names and array component
/// types are erased to [Kind::Reference]; `W` denotes [Kind::Word] and `R` is shorthand for an
/// anonymous reference.
impl FromStr for Signature {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || SignatureError::Malformed(s.to_owned());
        let mut chars = s.chars().peekable();
        if chars.next() != Some('(') {
            return Err(malformed());
        }
        let mut args = Vec::new();
        loop {
            match chars.peek() {
                Some(')') => {
                    chars.next();
                    break;
                }
                None => return Err(malformed()),
                Some(_) => (),
            }
            match parse_kind(&mut chars, s)? {
                Some(k) => args.push(k),
                None => return Err(SignatureError::VoidArgument),
            }
            if args.len() > MAX_ADAPTER_ARGS {
                return Err(SignatureError::TooManyArgs);
            }
        }
        let ret = parse_kind(&mut chars, s)?;
        if chars.next().is_some() {
            return Err(malformed());
        }
        Ok(Signature::new(args, ret))
    }
}

/// Parse one field descriptor, returning `None` for void.
fn parse_kind(chars: &mut Peekable<Chars>, desc: &str) -> Result<Option<Kind>, SignatureError> {
    match chars.next() {
        Some('V') => Ok(None),
        Some('L') => {
            for c in chars.by_ref() {
                if c == ';' {
                    return Ok(Some(Kind::Reference));
                }
            }
            Err(SignatureError::Malformed(desc.to_owned()))
        }
        Some('[') => match parse_kind(chars, desc)? {
            Some(_) => Ok(Some(Kind::Reference)),
            None => Err(SignatureError::Malformed(desc.to_owned())),
        },
        Some(c) => Kind::from_descriptor_char(c)
            .map(Some)
            .ok_or(SignatureError::UnknownKind(c)),
        None => Err(SignatureError::Malformed(desc.to_owned())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn widths_and_slots() {
        assert_eq!(Kind::COUNT, 10);
        for k in Kind::iter() {
            assert_eq!(k.stack_slots(8), 1);
            assert!(k.bit_width() <= 64);
        }
        assert_eq!(Kind::Long.stack_slots(4), 2);
        assert_eq!(Kind::Double.stack_slots(4), 2);
        assert_eq!(Kind::Int.stack_slots(4), 1);
        assert_eq!(Kind::Reference.stack_slots(4), 2);
        assert!(Kind::Float.is_float() && !Kind::Float.is_wide());
        assert!(Kind::Word.is_wide() && !Kind::Word.is_reference());
    }

    #[test]
    fn parse_descriptors() {
        let s = "(ILjava/lang/Object;[[JZ)Ljava/lang/String;"
            .parse::<Signature>()
            .unwrap();
        assert_eq!(
            s.args(),
            &[Kind::Int, Kind::Reference, Kind::Reference, Kind::Boolean]
        );
        assert_eq!(s.ret(), Some(Kind::Reference));
        assert_eq!(s.to_string(), "(IRRZ)R");
        assert_eq!(s.to_string().parse::<Signature>().unwrap(), s);

        let s = "()V".parse::<Signature>().unwrap();
        assert!(s.args().is_empty());
        assert_eq!(s.ret(), None);
        assert_eq!(s.to_string(), "()V");

        let s = "(BSCFDW)F".parse::<Signature>().unwrap();
        assert_eq!(s.args().len(), 6);
        assert_eq!(s.args()[5], Kind::Word);
    }

    #[test]
    fn parse_errors() {
        assert_eq!(
            "IV".parse::<Signature>(),
            Err(SignatureError::Malformed("IV".to_owned()))
        );
        assert_eq!(
            "(I".parse::<Signature>(),
            Err(SignatureError::Malformed("(I".to_owned()))
        );
        assert_eq!(
            "(Ljava/lang/Object)V".parse::<Signature>(),
            Err(SignatureError::Malformed("(Ljava/lang/Object)V".to_owned()))
        );
        assert_eq!("(IQ)V".parse::<Signature>(), Err(SignatureError::UnknownKind('Q')));
        assert_eq!("(IV)V".parse::<Signature>(), Err(SignatureError::VoidArgument));
        assert!(matches!(
            "(I)VV".parse::<Signature>(),
            Err(SignatureError::Malformed(_))
        ));
        let many = format!("({})V", "I".repeat(MAX_ADAPTER_ARGS + 1));
        assert_eq!(many.parse::<Signature>(), Err(SignatureError::TooManyArgs));
        let most = format!("({})V", "I".repeat(MAX_ADAPTER_ARGS));
        assert_eq!(most.parse::<Signature>().unwrap().args().len(), MAX_ADAPTER_ARGS);
    }
}
