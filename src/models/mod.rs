//! Reference recommenders.
//!
//! [`popularity::TopPopRecommender`] fits in a single step;
//! [`factorization::ImplicitFactorizationModel`] trains one epoch per step
//! and reports a validation point after each.
pub mod factorization;
pub mod popularity;
