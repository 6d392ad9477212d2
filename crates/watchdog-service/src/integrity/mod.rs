pub mod monitor;
pub mod scanner;
pub mod verifier;
