pub mod controller;
pub mod logger;
