pub(crate) mod logging;

pub(crate) mod mem_log;

pub(crate) mod network;

pub(crate) mod node;

pub(crate) mod playlist_app;
