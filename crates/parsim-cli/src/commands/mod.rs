pub mod common;
pub mod echo;
pub mod muxtree;
pub mod phold;
pub mod ring;
