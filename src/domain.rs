//! Domain layer: jobs, records, shard keys, quotas, proxies, accounts and the error taxonomy.

pub mod account;
pub mod errors;
pub mod job;
pub mod proxy;
pub mod quota;
pub mod record;
pub mod shard;

pub use account::{Account, NewAccount, SessionCookie};
pub use errors::TaskError;
pub use job::{
    FailureResetPolicy, HourWindow, Job, JobKind, JobParameters, JobStatus, NewJob, NewJobParameters,
};
pub use proxy::{NewProxy, Proxy, ProxyKind, ProxyStrategy};
pub use quota::{NewYearQuota, YearQuota, validate_quotas};
pub use record::{
    Comment, NewComment, NewRecord, PreparedRecord, Record, SampleSheets, SampledRecord, SubmittedRecord,
    format_comment_summary,
};
pub use shard::ShardKey;
