//! `procura-intake` — validated intake boundary + wishlist lifecycle.
//!
//! Raw customer/manager payloads enter here and nowhere else. The schema is
//! strict (tagged request kinds, unknown fields rejected); normalization
//! produces drafts the rest of the system can trust. No ledger access from
//! this crate.

pub mod request;
pub mod wishlist;

pub use request::{
    ApplicationDraft, IntakeConfig, IntakeRequest, RawApplication, RawLine, RawWishlist,
    WishlistDraft, WishlistLine, dedupe_lines, normalize, normalize_application,
};
pub use wishlist::{
    AmendLines, MarkConverted, SubmitWishlist, WishlistAmended, WishlistCommand,
    WishlistConverted, WishlistEntry, WishlistEntryId, WishlistEvent, WishlistSubmitted,
};
