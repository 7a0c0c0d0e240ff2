pub mod chart;
pub mod event;
pub mod presenter;
pub mod rail;
pub mod store;

pub use chart::{project_chart, ChartGeometry, Tick};
pub use event::{ChartKind, ChartSpec, Event, EventKind, RunStatus, Series};
pub use presenter::{BlockSignal, TextPresenter};
pub use rail::{project_rail, RailEntry, RAIL_CAP};
pub use store::{AgentSnapshot, InsightCard, StateStore, Thought};
