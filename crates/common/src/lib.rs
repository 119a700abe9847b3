// tandem-common: wire types shared by the realtime service, its clients, and domain services

pub mod protocol;
pub mod types;
