//! Shared protocol constants for the master/slave link and the client control channel

// Slave link header constants
pub const MAGIC: &[u8; 4] = b"DFTP";
pub const VERSION: u16 = 1;

// Maximum frame payload size (16MB); a full-tree listing is the largest payload
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

// Longest control-channel command line accepted from a client, CRLF included
pub const MAX_COMMAND_LINE: usize = 4096;

// Frame type IDs on the slave link (keep numeric stable)
pub mod frame {
    /// Slave -> master, first frame: slave name
    pub const HELLO: u8 = 1;
    /// Master -> slave: HELLO accepted
    pub const WELCOME: u8 = 2;
    /// Master -> slave: rejected (duplicate name etc.), payload is the reason
    pub const REJECT: u8 = 3;
    /// Master -> slave: bincode `Request`
    pub const REQUEST: u8 = 10;
    /// Slave -> master: bincode `Response`
    pub const RESPONSE: u8 = 11;
    /// Slave -> master: orderly shutdown, triggers unmerge
    pub const GOODBYE: u8 = 20;
}

/// FTP reply codes used by the transfer commands.
/// Values are fixed by client expectations and must not change.
pub mod reply {
    pub const FILE_STATUS_OK: u16 = 150;
    pub const COMMAND_OK: u16 = 200;
    pub const FILE_STATUS: u16 = 213;
    pub const SYSTEM_TYPE: u16 = 215;
    pub const SERVICE_READY: u16 = 220;
    pub const CLOSING: u16 = 221;
    pub const TRANSFER_COMPLETE: u16 = 226;
    pub const LOGGED_IN: u16 = 230;
    pub const ENTERING_PASSIVE: u16 = 227;
    pub const AUTH_OK: u16 = 234;
    pub const FILE_ACTION_OK: u16 = 250;
    pub const PATH_CREATED: u16 = 257;
    pub const NEED_PASSWORD: u16 = 331;
    pub const PENDING_FURTHER_INFORMATION: u16 = 350;
    pub const TLS_NOT_CONFIGURED: u16 = 400;
    pub const CANT_OPEN_DATA: u16 = 425;
    pub const TRANSFER_ABORTED: u16 = 426;
    pub const SLAVE_UNAVAILABLE: u16 = 450;
    pub const SYNTAX_ERROR_COMMAND: u16 = 500;
    pub const SYNTAX_ERROR: u16 = 501;
    pub const NOT_IMPLEMENTED: u16 = 502;
    pub const BAD_SEQUENCE: u16 = 503;
    pub const NOT_IMPLEMENTED_FOR_PARM: u16 = 504;
    pub const ACCESS_DENIED: u16 = 530;
    pub const ACTION_NOT_TAKEN: u16 = 550;
    pub const FILE_NAME_NOT_ALLOWED: u16 = 553;
}

// Centralized timeout constants
pub mod timeouts {
    // Frame header reads on an idle slave link are unbounded; once a header
    // arrived the payload must follow within this budget (ms)
    pub const READ_BASE_MS: u64 = 5_000;

    // Base timeout for writes (ms)
    pub const WRITE_BASE_MS: u64 = 5_000;

    // Additional timeout per MB of data (ms)
    pub const PER_MB_MS: u64 = 100;

    // Upper bound on any single RPC round trip (ms)
    pub const RPC_MS: u64 = 60_000;

    // Transfer status polling interval (ms)
    pub const STATUS_POLL_MS: u64 = 100;

    // How long a slave waits for the client on a data channel (ms)
    pub const DATA_ACCEPT_MS: u64 = 30_000;

    // Calculate write deadline based on payload size (ms)
    pub fn write_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        WRITE_BASE_MS + mb * PER_MB_MS
    }

    // Calculate read deadline based on payload size (ms)
    pub fn read_deadline_ms(payload_len: usize) -> u64 {
        let mb = (payload_len as u64 + 1_048_575) / 1_048_576;
        READ_BASE_MS + mb * PER_MB_MS
    }
}
