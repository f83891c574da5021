pub mod convert;
pub mod restore;
pub mod run;
pub mod setup;
pub mod verify;
