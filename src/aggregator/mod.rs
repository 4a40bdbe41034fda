/// Capacity-bounded sample series and their owning store
pub mod series;

pub use series::{SampleSeries, SeriesStore};
