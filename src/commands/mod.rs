mod check;
mod list;
mod show;

pub use check::check;
pub use list::list;
pub use show::show;
