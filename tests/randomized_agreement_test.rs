use log::LevelFilter;
use rand::{rngs::StdRng, Rng, SeedableRng};
use threepc_rs::{
    three_phase_commit::{messages::Vote, types::Decision},
    types::data_types::{ProcessID, TransactionID},
};

mod common;

use crate::common::{
    logging::setup_logger,
    network::mock_network,
    node::{wait_for_decisions, Node},
    playlist_app::PlaylistCommand,
};

const NUM_PROCESSES: u32 = 4;
const NUM_TRANSACTIONS: u64 = 20;

#[test]
fn randomized_agreement_test() {
    setup_logger(LevelFilter::Info);

    let nodes: Vec<Node> = mock_network(NUM_PROCESSES)
        .into_iter()
        .zip(ProcessID::all(NUM_PROCESSES))
        .map(|(network, me)| Node::new(me, NUM_PROCESSES, network))
        .collect();
    let mut rng = StdRng::seed_from_u64(0x3_9c);

    for id in 1..=NUM_TRANSACTIONS {
        let transaction = TransactionID::new(id);
        let coordinator = rng.gen_range(0..NUM_PROCESSES) as usize;

        // Each participant votes No with probability 1/5.
        let mut anyone_votes_no = false;
        for (index, node) in nodes.iter().enumerate() {
            if index != coordinator && rng.gen_bool(0.2) {
                node.process().override_next_vote(Vote::No);
                anyone_votes_no = true;
            }
        }

        let song = format!("song-{}", rng.gen_range(0..5));
        let command = match rng.gen_range(0..3) {
            0 => PlaylistCommand::add(&song, &format!("https://example.com/{}/{}", song, id)),
            1 => PlaylistCommand::edit(&song, &format!("https://example.com/{}/edited/{}", song, id)),
            _ => PlaylistCommand::delete(&song),
        };
        nodes[coordinator].begin(transaction, command);

        // Agreement, and commit exactly when every participant voted Yes.
        let expected = if anyone_votes_no {
            Decision::Abort
        } else {
            Decision::Commit
        };
        assert_eq!(
            wait_for_decisions(&nodes, transaction),
            vec![expected; NUM_PROCESSES as usize],
            "transaction {} coordinated by process {}",
            transaction,
            coordinator
        );
    }

    // Every playlist applied the same transactions in the same order, and ended up the same.
    let completed = nodes[0].playlist().completed();
    let songs = nodes[0].playlist().songs();
    for node in &nodes[1..] {
        assert_eq!(node.playlist().completed(), completed);
        assert_eq!(node.playlist().songs(), songs);
    }
}
