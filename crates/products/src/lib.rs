//! `procura-products` — canonical catalog records.
//!
//! A [`Product`] is created from a wishlist or application line the first
//! time it is ordered; later orders for the same logical product resolve to
//! the existing record via the normalized [`ProductKey`].

pub mod product;

pub use product::{
    CreateProduct, Product, ProductCommand, ProductCreated, ProductEvent, ProductId, ProductKey,
};
