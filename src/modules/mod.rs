pub mod cas_api;
