use std::fmt;

use crate::codec::FramingError;

/// Remote operations known to the rpc tester.
///
/// The numeric ids are part of the wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum RpcVerb {
    Hello = 0,
    Bye = 1,
    Echo = 2,
}

impl RpcVerb {
    pub const ALL: [RpcVerb; 3] = [RpcVerb::Hello, RpcVerb::Bye, RpcVerb::Echo];

    #[inline]
    pub fn id(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for RpcVerb {
    type Error = FramingError;

    fn try_from(id: i32) -> Result<Self, Self::Error> {
        match id {
            0 => Ok(RpcVerb::Hello),
            1 => Ok(RpcVerb::Bye),
            2 => Ok(RpcVerb::Echo),
            other => Err(FramingError::UnknownVerb(other)),
        }
    }
}

impl fmt::Display for RpcVerb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RpcVerb::Hello => "HELLO",
            RpcVerb::Bye => "BYE",
            RpcVerb::Echo => "ECHO",
        })
    }
}
