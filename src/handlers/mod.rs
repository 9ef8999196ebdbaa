pub mod billing;
pub mod links;
pub mod redirect;
