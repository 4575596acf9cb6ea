//! Prerequisite graph engine for course islands.
//!
//! Each course's islands and their prerequisite edges form a DAG. The
//! engine keeps it acyclic, keeps every island's `position` equal to its
//! topological depth (so for every edge `A requires B`,
//! `position[A] > position[B]`), and emits the events describing each
//! committed change.
//!
//! Edge lists are always replaced as a whole. A replacement is first
//! planned as a pure function of the course's graph snapshot
//! ([`plan_prerequisites`]); the store is only written with an accepted
//! plan, so a rejected list never touches the stored edges.

pub mod dag;
pub mod engine;
pub mod error;
pub mod service;
pub mod store;

pub use dag::{compute_positions, plan_prerequisites, CourseGraph, CycleError, GraphPlan, PositionChange};
pub use engine::{
    create_course, create_island, list_islands, update_island, Dispatch, EdgeChange,
    UpdateIslandRequest, UpdateOutcome,
};
pub use error::GraphError;
pub use service::IslandService;
pub use store::{Course, Island, NewCourse, NewIsland, UpdateIslandParams};
