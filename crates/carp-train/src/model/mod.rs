//! Two-tower model components.
//!
//! ```text
//! passage tokens ──> TextEncoder ──> ProjectionLayer ──> P [N, latent]
//! review tokens  ──> TextEncoder ──> ProjectionLayer ──> R [N, latent]
//!                                    LogitScale ──> exp(clamp(t))
//! ```

mod carp;
pub mod encoder;
pub mod ops;
mod projection;
pub mod temperature;
mod tower;

pub use carp::CarpModel;
pub use encoder::TextEncoder;
pub use projection::ProjectionLayer;
pub use temperature::{LogitScale, LOGIT_SCALE_MAX, LOGIT_SCALE_MIN};
pub use tower::Tower;
