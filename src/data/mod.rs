/// Data layer: cell values, event tables, loading, and row filtering.
///
/// Architecture:
/// ```text
///  setup file + .csv / .json / .parquet
///        │
///        ▼
///   ┌──────────┐
///   │  loader   │  parse tables → Tube, setup → Experiment
///   └──────────┘
///        │
///        ▼
///   ┌────────────┐
///   │ EventTable  │  typed columns: channels, conditions, derived
///   └────────────┘
///        │
///        ▼
///   ┌──────────┐
///   │  filter   │  Predicate over columns → selected row indices
///   └──────────┘
/// ```

pub mod loader;
pub mod model;
pub mod filter;
