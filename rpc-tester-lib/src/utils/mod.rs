pub mod env;

#[cfg(target_family = "unix")]
pub mod os;
