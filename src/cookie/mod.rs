mod jar;

pub use jar::{Cookie, Jar, Priority, SameSite};
