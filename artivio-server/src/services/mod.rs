pub mod chat_engine;
pub mod context_cache;
pub mod reply_generator;
