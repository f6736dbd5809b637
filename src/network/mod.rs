//! Network Layer
//!
//! WebSocket front end. Clients authenticate with a JWT, send commands, and
//! receive the engine's round events. No round logic lives here.

pub mod auth;
pub mod protocol;
pub mod rate_limit;
pub mod server;

pub use auth::{AuthConfig, TokenClaims, AuthError, validate_token};
pub use protocol::{ClientMessage, ServerMessage, BetRequest, ErrorCode};
pub use rate_limit::{BetRateLimiter, RateLimitConfig};
pub use server::{GameServer, ServerConfig, GameServerError, CommandHandler, ClientSession};
