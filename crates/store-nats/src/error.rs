use derive_more::From;
use netmesh_store::StoreError;

#[derive(Clone, Debug, From)]
pub enum Error {
    #[from]
    CreateKeyValue(async_nats::jetstream::context::CreateKeyValueErrorKind),

    #[from]
    Create(async_nats::jetstream::kv::CreateErrorKind),

    #[from]
    Entry(async_nats::jetstream::kv::EntryErrorKind),

    History(async_nats::jetstream::kv::HistoryErrorKind),

    Delete(async_nats::jetstream::kv::DeleteErrorKind),

    #[from]
    Update(async_nats::jetstream::kv::UpdateErrorKind),

    #[from]
    Watch(async_nats::jetstream::kv::WatchErrorKind),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Store error")
    }
}

impl std::error::Error for Error {}

impl StoreError for Error {}
