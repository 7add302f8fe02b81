//! [`Playlist`], the implementation of [`App`] used in all of the integration tests.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
};

use borsh::{BorshDeserialize, BorshSerialize};
use threepc_rs::{
    app::App,
    types::data_types::{Payload, TransactionID},
};

/// A playlist of `<song, url>` pairs, changed one command per committed transaction.
///
/// Clones share the same playlist, so that the test can inspect what a process has applied, and so that a
/// restarted process finds the playlist in the state its previous incarnation left it, as a playlist
/// stored on disk would be.
#[derive(Clone, Default)]
pub(crate) struct Playlist(Arc<Mutex<PlaylistState>>);

#[derive(Default)]
struct PlaylistState {
    songs: BTreeMap<String, String>,
    completed: Vec<TransactionID>,
}

/// The payload of a playlist transaction.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub(crate) enum PlaylistCommand {
    /// Add a song, or replace its url if it is already in the playlist.
    Add { song: String, url: String },

    /// Change the url of a song. No-op if the song is not in the playlist.
    Edit { song: String, url: String },

    /// Remove a song. No-op if the song is not in the playlist.
    Delete { song: String },
}

impl PlaylistCommand {
    pub(crate) fn add(song: &str, url: &str) -> PlaylistCommand {
        PlaylistCommand::Add {
            song: song.to_string(),
            url: url.to_string(),
        }
    }

    pub(crate) fn edit(song: &str, url: &str) -> PlaylistCommand {
        PlaylistCommand::Edit {
            song: song.to_string(),
            url: url.to_string(),
        }
    }

    pub(crate) fn delete(song: &str) -> PlaylistCommand {
        PlaylistCommand::Delete {
            song: song.to_string(),
        }
    }

    pub(crate) fn payload(&self) -> Payload {
        Payload::new(self.try_to_vec().unwrap())
    }
}

impl Playlist {
    pub(crate) fn new() -> Playlist {
        Self::default()
    }

    /// The url of `song`, if the song is in the playlist.
    pub(crate) fn url(&self, song: &str) -> Option<String> {
        self.0.lock().unwrap().songs.get(song).cloned()
    }

    pub(crate) fn songs(&self) -> BTreeMap<String, String> {
        self.0.lock().unwrap().songs.clone()
    }

    /// IDs of the applied transactions, in the order they were applied.
    pub(crate) fn completed(&self) -> Vec<TransactionID> {
        self.0.lock().unwrap().completed.clone()
    }
}

impl App for Playlist {
    fn apply(&mut self, transaction: TransactionID, payload: &Payload) {
        let command = PlaylistCommand::deserialize(&mut payload.bytes().as_slice()).unwrap();
        let mut state = self.0.lock().unwrap();
        match command {
            PlaylistCommand::Add { song, url } => {
                state.songs.insert(song, url);
            }
            PlaylistCommand::Edit { song, url } => {
                if let Some(current) = state.songs.get_mut(&song) {
                    *current = url;
                }
            }
            PlaylistCommand::Delete { song } => {
                state.songs.remove(&song);
            }
        }
        state.completed.push(transaction);
    }

    fn is_applied(&self, transaction: TransactionID) -> bool {
        self.0.lock().unwrap().completed.contains(&transaction)
    }
}
