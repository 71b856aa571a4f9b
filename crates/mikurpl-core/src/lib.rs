pub mod client;
pub mod connector;
pub mod gtid;
pub mod privileges;
pub mod setup;
#[cfg(any(test, feature = "sim"))]
pub mod sim;
pub mod skip;
pub mod sql;
pub mod validator;

pub use mikurpl_common as common;

pub use client::{DatabaseClient, QueryRows, ServerConnection};
pub use connector::{connect, connect_all, connect_pair, ConnectorOptions, EngineInfo, ServerEndpoint};
pub use gtid::{Gtid, GtidSet, Interval};
pub use privileges::{check_privileges, GlobalPrivileges, REPLICATION_PRIVILEGES};
pub use setup::{
    channel_status, configure_replication, ensure_replication_user, setup_replication, stop_replication,
    ChannelStatus, LinkStatus, ReplicationLink, SetupOptions, SetupOutcome, Verification,
};
pub use skip::{skip_transactions, SkipOptions, SkipOutcome, SkipReport, SubordinateSkip};
pub use sql::Dialect;
pub use validator::{
    check, validate, CheckId, CheckResult, Finding, InnoDbFacts, ServerFacts, Severity, TopologyCheckReport,
    ValidatorOptions,
};

pub use common::{ConnectionDescriptor, ReplicationUser, RplError, RplResult, ServerRole, ServerVersion};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
