pub mod chat;
pub mod chunks;
pub mod knowledge;
pub mod knowledge_bases;
pub mod messages;
pub mod sessions;
pub mod tenants;
