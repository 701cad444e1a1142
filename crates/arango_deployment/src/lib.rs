pub mod api;
pub mod arangod;
pub mod controllers;
pub mod platform;
pub mod util;

#[cfg(test)]
mod testing;
