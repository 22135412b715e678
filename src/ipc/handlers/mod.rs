pub mod attendance;
pub mod backup;
pub mod core;
pub mod exams;
pub mod grades;
pub mod promotion;
pub mod reports;
pub mod reservations;
pub mod subjects;
pub mod users;
