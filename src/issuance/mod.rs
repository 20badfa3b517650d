pub mod account;
pub mod authorizer;
pub mod csr;
pub mod directory;
pub mod error;
pub mod flow;
pub mod http_directory;
pub mod issuer;
pub mod polling;
pub mod registrar;
