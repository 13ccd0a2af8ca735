mod shared;
pub mod small_encoder;
pub mod teacher_encoder;

pub use small_encoder::SmallEncoder;
pub use teacher_encoder::TeacherEncoder;
