pub mod errors;
pub mod request;
pub mod response;

#[macro_use]
pub mod macros;
