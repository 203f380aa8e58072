pub mod db;
pub mod model;
pub mod users;

pub use db::{InsertOutcome, LicenseFilter, StatusCounts, Store};
pub use model::{
    DiscordConfig, HwidPolicy, LicenseFeatures, LicenseRecord, LicenseStatus, LicenseView,
    Setting, UserRecord, UserView,
};
pub use users::UserInsertOutcome;
