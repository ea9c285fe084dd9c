//! Protocol-wide limits and well-known indices.
//!
//! These values are part of the wire contract between server, game module and
//! client: changing one is a protocol version bump.

/// Protocol version for compatibility checks.
pub const PROTOCOL_VERSION: i32 = 26;

pub const MAX_CLIENTS: usize = 32;

pub const GENTITYNUM_BITS: u32 = 10;
pub const MAX_GENTITIES: usize = 1 << GENTITYNUM_BITS;

/// Entity numbers past this one are reserved.
pub const ENTITYNUM_NONE: usize = MAX_GENTITIES - 1;
pub const ENTITYNUM_WORLD: usize = MAX_GENTITIES - 2;
pub const ENTITYNUM_MAX_NORMAL: usize = MAX_GENTITIES - 2;

pub const MAX_CONFIGSTRINGS: usize = 1700;

pub const MAX_STRING_CHARS: usize = 1024;
pub const MAX_TOKEN_CHARS: usize = 1024;
pub const MAX_INFO_STRING: usize = 1024;
pub const MAX_QPATH: usize = 64;
pub const MAX_NAME_LENGTH: usize = 32;

/// Outstanding reliable commands per client before it must be dropped.
pub const MAX_RELIABLE_COMMANDS: usize = 128;

/// Snapshot frames retained per client for delta baselines.
pub const PACKET_BACKUP: usize = 32;
pub const PACKET_MASK: usize = PACKET_BACKUP - 1;

/// Upper bound on entities carried by a single snapshot.
pub const MAX_SNAPSHOT_ENTITIES: usize = 256;

pub const MAX_ENT_CLUSTERS: usize = 16;

pub const MAX_SPAWN_VARS: usize = 64;
pub const MAX_SPAWN_VARS_CHARS: usize = 4096;

pub const SERVER_MAXBANS: usize = 1024;

pub const MAX_DOWNLOAD_WINDOW: usize = 8;
pub const MAX_DOWNLOAD_BLKSIZE: usize = 2048;

pub const MAX_PERSISTENT_DATA_STORES: usize = 16;

// Configstring indices.
pub const CS_SERVERINFO: usize = 0;
pub const CS_SYSTEMINFO: usize = 1;
pub const CS_MUSIC: usize = 2;
pub const CS_MESSAGE: usize = 3;
pub const CS_MOTD: usize = 4;
pub const CS_WARMUP: usize = 5;
pub const CS_GAME_VERSION: usize = 20;
pub const CS_LEVEL_START_TIME: usize = 21;
pub const CS_GLOBAL_AMBIENT_SET: usize = 22;
pub const CS_LOCATIONS: usize = 32;
pub const CS_MODELS: usize = 100;
pub const CS_SOUNDS: usize = CS_MODELS + MAX_MODELS;
pub const CS_PLAYERS: usize = CS_SOUNDS + MAX_SOUNDS;
pub const CS_AMBIENT_SOUNDSETS: usize = CS_PLAYERS + MAX_CLIENTS;
pub const CS_LIGHT_STYLES: usize = 1100;

pub const LS_STYLES_START: usize = 0;
pub const LS_NUM_STYLES: usize = 32;

pub const MAX_LOCATIONS: usize = 64;
pub const MAX_MODELS: usize = 256;
pub const MAX_SOUNDS: usize = 256;
pub const MAX_AMBIENT_SETS: usize = 256;

const _: () = assert!(CS_LIGHT_STYLES + (LS_STYLES_START + LS_NUM_STYLES) * 3 <= MAX_CONFIGSTRINGS);
const _: () = assert!(CS_LOCATIONS + MAX_LOCATIONS <= CS_MODELS);
const _: () = assert!(CS_AMBIENT_SOUNDSETS + MAX_AMBIENT_SETS <= CS_LIGHT_STYLES);
