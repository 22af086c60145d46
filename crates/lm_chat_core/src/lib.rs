pub mod domain;
pub mod ports;

pub use domain::{AuthSession, Chat, ChatKind, Message, User, UserCredentials};
pub use ports::{
    DatabaseService, GenerationOptions, LanguageModelService, MusicCatalogService, PortError,
    PortResult, TokenStream,
};
