//! Hard caps on guest-supplied input and table sizes.

pub const MAX_NAME_LEN: usize = 120;
pub const MAX_EMAIL_LEN: usize = 254;
pub const MAX_PHONE_LEN: usize = 40;
pub const MAX_NOTES_LEN: usize = 1000;
pub const MAX_CLOSURE_NOTE_LEN: usize = 200;

pub const MAX_RESERVATIONS: usize = 500_000;
pub const MAX_CLIENTS: usize = 200_000;
pub const MAX_PUSH_SUBSCRIPTIONS: usize = 500;
pub const MAX_ENDPOINT_LEN: usize = 2048;

/// Rows accepted from a single CSV import.
pub const MAX_IMPORT_ROWS: usize = 50_000;
/// Recipients pulled from the email provider per sync.
pub const EMAIL_HISTORY_LIMIT: usize = 1000;

pub const MAX_CHECKOUT_AMOUNT_CENTS: i64 = 1_000_000;
pub const MAX_CHECKOUT_QUANTITY: u32 = 50;
pub const MAX_DESCRIPTION_LEN: usize = 200;
