use crate::key::SongKey;
use crate::library::LocalLibrary;
use crate::overlay::MessageListener;
use crate::tagger::VotingMessage;
use log::{debug, warn};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};

/// Answers other peers: song requests from the local library, votes into the
/// tag consensus loop.
pub struct PeerMessageHandler {
    library: Arc<LocalLibrary>,
    votes: Mutex<Sender<VotingMessage>>,
}

impl PeerMessageHandler {
    #[must_use]
    pub fn new(library: Arc<LocalLibrary>, votes: Sender<VotingMessage>) -> Self {
        Self {
            library,
            votes: Mutex::new(votes),
        }
    }
}

impl MessageListener for PeerMessageHandler {
    fn on_song_request(&self, key: &SongKey) -> Option<Vec<u8>> {
        match self.library.read_song_bytes(key) {
            Ok(Some(bytes)) => {
                debug!("Serving song {key} ({} bytes)", bytes.len());
                Some(bytes)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Cannot serve song {key}: {e:#}");
                None
            }
        }
    }

    fn on_vote(&self, message: VotingMessage) {
        let sender = self.votes.lock().unwrap_or_else(PoisonError::into_inner);
        if sender.send(message).is_err() {
            debug!("Tag consensus stopped, incoming vote dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::song::Song;
    use crate::tagger::VoteDirection;
    use std::fs;
    use std::sync::mpsc;
    use tempfile::TempDir;

    #[test]
    fn test_serves_local_songs_and_forwards_votes() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("Folk/Nick Drake/Pink Moon.flac");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, "moon").unwrap();
        let library = Arc::new(LocalLibrary::open(dir.path(), None).unwrap());

        let (tx, rx) = mpsc::channel();
        let handler = PeerMessageHandler::new(library, tx);

        let song = Song::new("Pink Moon", "Nick Drake", "Folk");
        assert_eq!(handler.on_song_request(song.key()), Some(b"moon".to_vec()));
        assert_eq!(handler.on_song_request(&SongKey::hash(b"other")), None);

        let vote = VotingMessage::new("Folk", vec![], song, VoteDirection::Up);
        handler.on_vote(vote.clone());
        assert_eq!(rx.recv().unwrap(), vote);
    }
}
