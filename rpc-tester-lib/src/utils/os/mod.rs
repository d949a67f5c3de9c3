mod unix;
pub use self::unix::*;
