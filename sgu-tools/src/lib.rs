pub mod nom;
pub mod num;
