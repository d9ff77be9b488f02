pub mod os;
pub mod url;
