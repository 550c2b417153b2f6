pub mod login_static;
