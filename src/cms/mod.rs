pub mod backend;
pub mod bootstrap;
pub mod models;
pub mod routes;
pub mod session;
pub mod supabase;
