pub mod drawable_data;
pub mod threaded_vector;
pub mod threading;

pub use drawable_data::{DrawableFrame, DrawableTraits, SceneDrawableData, ZRange};
pub use threaded_vector::ThreadedVector;
pub use threading::{TaskQueue, WorkQueue};
