//! Read-side projections of a fetched tree
//!
//! The nested hierarchy backs the list view; the timeline backs the dated view.
//! Both are pure functions of an `EntitySet`.

mod hierarchy;
mod timeline;
mod types;

pub use hierarchy::{aggregate, flatten};
pub use timeline::{timeline, GroupBy, Timeline, TimelineGroup, TimelineItem};
pub use types::{Hierarchy, ListRow, OpportunityEntry, OutcomeEntry, SolutionEntry};
