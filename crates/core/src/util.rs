use ulid::Ulid;

/// Generates a fresh retry-queue entry id (ULID string, time-sortable).
pub fn new_entry_id() -> String {
    Ulid::new().to_string()
}
