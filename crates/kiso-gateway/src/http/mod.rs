pub mod admin;
pub mod health;
pub mod msg;
pub mod pub_files;
pub mod sessions;
pub mod status;
