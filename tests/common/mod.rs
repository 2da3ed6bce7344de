mod test_server;

pub use test_server::{PASSWORD, TestServer, assert_error};
