//! Growth factors: year-indexed uprating of monetary, count and categorical variables

mod table;
mod provider;
mod uprate;
pub mod loader;

pub use table::{GrowthFactor, GrowthFactorTable};
pub use provider::{FactorEntry, GrowthFactorProvider, IndexedFactorProvider, StaticFactorProvider};
pub use uprate::{bind_factors, draw_seed, unit_draw, uprate_record, BoundFactor, UprateOptions};
pub use loader::{load_growth_factors, load_growth_factors_from_reader};
