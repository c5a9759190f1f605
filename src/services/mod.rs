pub mod auth_service;
pub mod channel_service;
pub mod cookie_jar_service;
pub mod gql_service;
pub mod http_service;
pub mod inventory_service;
pub mod mining_service;
pub mod watch_service;
pub mod websocket_service;
