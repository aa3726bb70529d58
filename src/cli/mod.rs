pub mod classify;
pub mod init;
pub mod pending;
pub mod run;
