use crate::convert::safe_kv;
use crate::Entry;
use crate::KvCommand;

pub(crate) fn put_entry(
    index: u64,
    term: u64,
    key: &[u8],
    value: &[u8],
) -> Entry {
    Entry {
        index,
        term,
        command: KvCommand::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        }
        .encode(),
    }
}

pub(crate) fn incr_entry(
    index: u64,
    term: u64,
    key: &[u8],
) -> Entry {
    Entry {
        index,
        term,
        command: KvCommand::Incr { key: key.to_vec() }.encode(),
    }
}

pub(crate) fn delete_entry(
    index: u64,
    term: u64,
    key: &[u8],
) -> Entry {
    Entry {
        index,
        term,
        command: KvCommand::Delete { key: key.to_vec() }.encode(),
    }
}

/// One `Put` entry per id in `ids`, with key and value both `safe_kv(id)`,
/// indexed consecutively starting at `start_index`.
pub(crate) fn put_entries(
    start_index: u64,
    term: u64,
    ids: Vec<u64>,
) -> Vec<Entry> {
    ids.into_iter()
        .enumerate()
        .map(|(offset, id)| put_entry(start_index + offset as u64, term, &safe_kv(id), &safe_kv(id)))
        .collect()
}

static LOGGER_INIT: once_cell::sync::Lazy<()> = once_cell::sync::Lazy::new(|| {
    env_logger::init();
});

pub fn enable_logger() {
    *LOGGER_INIT;
    println!("setup logger for unit test.");
}
