pub mod dao;
pub mod models;
pub mod postgres;

pub use dao::OrderStore;
pub use postgres::PgOrderStore;
