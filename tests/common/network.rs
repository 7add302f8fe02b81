use std::{
    collections::HashMap,
    sync::{
        mpsc::{self, Receiver, Sender, TryRecvError},
        Arc, Mutex,
    },
};

use threepc_rs::{
    networking::{messages::Message, network::Network},
    types::data_types::ProcessID,
};

/// A mock network stub which passes messages from and to threads using channels.
#[derive(Clone)]
pub(crate) struct NetworkStub {
    all_peers: HashMap<ProcessID, Sender<Message>>,
    inbox: Arc<Mutex<Receiver<Message>>>,
}

impl NetworkStub {
    /// Throw away everything delivered to this stub so far. Used when restarting a crashed process, which
    /// must not see the messages sent to it while it was down.
    pub(crate) fn discard_inbox(&self) {
        while self.inbox.lock().unwrap().try_recv().is_ok() {}
    }
}

impl Network for NetworkStub {
    fn send(&mut self, peer: ProcessID, message: Message) {
        if let Some(peer) = self.all_peers.get(&peer) {
            let _ = peer.send(message);
        }
    }

    fn recv(&mut self) -> Option<Message> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => panic!(),
        }
    }
}

pub(crate) fn mock_network(num_processes: u32) -> Vec<NetworkStub> {
    let mut all_peers = HashMap::new();
    let inboxes: Vec<Receiver<Message>> = ProcessID::all(num_processes)
        .map(|process| {
            let (sender, receiver) = mpsc::channel();
            all_peers.insert(process, sender);
            receiver
        })
        .collect();

    inboxes
        .into_iter()
        .map(|inbox| NetworkStub {
            all_peers: all_peers.clone(),
            inbox: Arc::new(Mutex::new(inbox)),
        })
        .collect()
}
