//! Boson node binary support library.

pub mod config;
