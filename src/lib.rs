//! # Matchmove Solver
//!
//! Solves scene attributes (camera transforms, focal lengths, bundle positions)
//! so that 3D bundles reproject onto their tracked 2D markers.
//!
//! - [`core`]: ids, frames, scene collaborator traits and the reprojection error function
//! - [`optimizer`]: Levenberg-Marquardt engines over a generic error function
//! - [`linalg`]: sparse Jacobians and the dense/sparse normal equation solvers
//! - [`solver`]: options, the solve controller and its report
//! - [`scene`]: an in-memory scene and pinhole camera math
//! - [`io`]: JSON scene files

pub mod core;
pub mod error;
pub mod io;
pub mod linalg;
pub mod logger;
pub mod optimizer;
pub mod scene;
pub mod solver;

pub use error::{MatchmoveError, MatchmoveResult};
pub use io::SceneFile;
pub use logger::{init_logger, init_logger_with_level};
pub use optimizer::EngineKind;
pub use solver::{SolveController, SolveReport, SolveStatus, SolverOptions};
