//! Integration tests for the chainstate engine

use chainstate::*;

fn params() -> ConsensusParams {
    ConsensusParams::regtest()
}

fn engine() -> ChainstateManager<MemoryStore> {
    ChainstateManager::new(
        MemoryStore::new(),
        params(),
        Box::new(StackEvaluator::new()),
        Box::new(FixedTime(1_000_000)),
    )
    .unwrap()
}

fn coinbase(value: Integer, tag: u32) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            prevout: OutPoint::null(),
            witness: vec![],
            sequence: tag,
        }],
        outputs: vec![TxOutput {
            value,
            lock_script: vec![0x51],
        }],
        lock_time: 0,
    }
}

fn build_block(prev: BlockId, timestamp: u64, txs: Vec<Transaction>) -> Block {
    let p = params();
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: prev,
            merkle_root: [0; 32],
            timestamp,
            bits: p.pow_limit_bits,
            nonce: 0,
        },
        transactions: txs,
    };
    block.header.merkle_root = merkle_root(&block.transactions).unwrap_or([0; 32]);
    while chainstate::pow::check_proof_of_work(&block.header, &p).is_err() {
        block.header.nonce += 1;
    }
    block
}

fn spend_to(prevout: OutPoint, value: Integer) -> Transaction {
    Transaction {
        version: 1,
        inputs: vec![TxInput {
            prevout,
            witness: vec![],
            sequence: 0xffff_fffd,
        }],
        outputs: vec![TxOutput {
            value,
            lock_script: vec![0x51],
        }],
        lock_time: 0,
    }
}

/// Extend the active chain with `count` empty blocks, returning the tip id.
fn mine_empty(m: &mut ChainstateManager<MemoryStore>, mut prev: BlockId, count: u64) -> BlockId {
    let p = params();
    let start = m.tip().map(|(_, h)| h).unwrap_or(0);
    for i in 1..=count {
        let block = build_block(
            prev,
            1_000 + (start + i) * 100,
            vec![coinbase(p.initial_subsidy, (start + i) as u32)],
        );
        prev = block.block_id();
        m.accept_block(block).unwrap();
    }
    prev
}

#[test]
fn test_single_coinbase_block_on_empty_state() {
    // Empty coin view, one coinbase-only block at height 0: exactly one new
    // coin carrying the full subsidy, flagged coinbase, created at height 0.
    let mut m = engine();
    let p = params();
    let genesis = build_block([0; 32], 1_000, vec![coinbase(p.initial_subsidy, 0)]);
    let cb_txid = genesis.transactions[0].txid();

    let outcome = m.accept_block(genesis).unwrap();
    assert!(matches!(outcome, AcceptOutcome::Connected(_)));

    let coin = m.utxo(&OutPoint::new(cb_txid, 0)).unwrap().unwrap();
    assert_eq!(coin.value, p.initial_subsidy);
    assert!(coin.is_coinbase);
    assert_eq!(coin.height, 0);
    assert!(m.utxo(&OutPoint::new(cb_txid, 1)).unwrap().is_none());
}

#[test]
fn test_coinbase_maturity_boundary() {
    // A coinbase output is spendable at creation height + maturity, and not
    // one block earlier.
    let mut m = engine();
    let p = params();
    let genesis = build_block([0; 32], 1_000, vec![coinbase(p.initial_subsidy, 0)]);
    let gid = genesis.block_id();
    let cb_txid = genesis.transactions[0].txid();
    m.accept_block(genesis).unwrap();

    // Chain height maturity-2: the next block (height maturity-1) would
    // spend one block before the output matures.
    let tip = mine_empty(&mut m, gid, p.coinbase_maturity - 2);
    let premature_height = m.tip().unwrap().1 + 1;
    assert_eq!(premature_height, p.coinbase_maturity - 1);

    let spend = spend_to(OutPoint::new(cb_txid, 0), p.initial_subsidy - 2_000_000);
    let premature = build_block(
        tip,
        1_000 + premature_height * 100,
        vec![coinbase(p.initial_subsidy + 2_000_000, 500), spend.clone()],
    );
    let err = m.accept_block(premature).unwrap_err();
    match err {
        ChainstateError::Chain(ChainError::Block(BlockError::Tx { index, source })) => {
            assert_eq!(index, 1);
            assert_eq!(
                source,
                TxError::PrematureSpend {
                    matures_at: p.coinbase_maturity
                }
            );
        }
        other => panic!("expected premature-spend rejection, got {other:?}"),
    }

    // One empty block later the same spend connects.
    let tip = mine_empty(&mut m, tip, 1);
    let height = m.tip().unwrap().1 + 1;
    assert_eq!(height, p.coinbase_maturity);
    let block = build_block(
        tip,
        1_000 + height * 100,
        vec![coinbase(p.initial_subsidy + 2_000_000, 501), spend],
    );
    let outcome = m.accept_block(block).unwrap();
    assert!(matches!(outcome, AcceptOutcome::Connected(_)));
}

#[test]
fn test_competing_tips_and_reorganization() {
    // Two equal-work extensions: the first seen stays active. A longer
    // extension of the losing branch forces a reorganization, after which
    // the coin view reflects only the winning branch.
    let mut m = engine();
    let p = params();
    let genesis = build_block([0; 32], 1_000, vec![coinbase(p.initial_subsidy, 0)]);
    let gid = genesis.block_id();
    m.accept_block(genesis).unwrap();

    let a1 = build_block(gid, 2_000, vec![coinbase(p.initial_subsidy, 1)]);
    let b1 = build_block(gid, 2_001, vec![coinbase(p.initial_subsidy, 2)]);
    let a1_out = OutPoint::new(a1.transactions[0].txid(), 0);
    let b1_out = OutPoint::new(b1.transactions[0].txid(), 0);

    assert!(matches!(
        m.accept_block(a1.clone()).unwrap(),
        AcceptOutcome::Connected(_)
    ));
    assert!(matches!(
        m.accept_block(b1.clone()).unwrap(),
        AcceptOutcome::SideChain(_)
    ));
    assert_eq!(m.tip().unwrap().0, a1.block_id());

    let b2 = build_block(b1.block_id(), 3_000, vec![coinbase(p.initial_subsidy, 3)]);
    let outcome = m.accept_block(b2.clone()).unwrap();
    match outcome {
        AcceptOutcome::Connected(change) => {
            assert_eq!(change.disconnected, vec![a1.block_id()]);
            assert_eq!(change.connected, vec![b1.block_id(), b2.block_id()]);
            assert_eq!(change.new_tip, b2.block_id());
        }
        other => panic!("expected reorganization, got {other:?}"),
    }

    assert!(m.utxo(&a1_out).unwrap().is_none());
    assert!(m.utxo(&b1_out).unwrap().is_some());
    assert_eq!(m.tip(), Some((b2.block_id(), 2)));
}

#[test]
fn test_replace_by_fee_in_pool() {
    // A pooled spend is only displaced by a conflicting spend paying a
    // strictly higher fee rate.
    let mut m = engine();
    let p = params();
    let genesis = build_block([0; 32], 1_000, vec![coinbase(p.initial_subsidy, 0)]);
    let gid = genesis.block_id();
    let cb_txid = genesis.transactions[0].txid();
    m.accept_block(genesis).unwrap();
    mine_empty(&mut m, gid, p.coinbase_maturity);

    // A: healthy fee.
    let a = spend_to(OutPoint::new(cb_txid, 0), p.initial_subsidy - 5_000_000);
    let a_id = a.txid();
    m.submit_transaction(a).unwrap();

    // B: same input, lower fee: rejected as conflicting.
    let b = spend_to(OutPoint::new(cb_txid, 0), p.initial_subsidy - 4_000_000);
    let err = m.submit_transaction(b).unwrap_err();
    assert!(matches!(
        err,
        ChainstateError::Pool(PoolError::Policy(PolicyError::ConflictingTransaction))
    ));
    assert!(m.pool().contains(&a_id));

    // B': same input, much higher fee: replaces A.
    let b_prime = spend_to(OutPoint::new(cb_txid, 0), p.initial_subsidy - 10_000_000);
    let b_prime_id = b_prime.txid();
    let update = m.submit_transaction(b_prime).unwrap();
    assert_eq!(update.accepted, vec![b_prime_id]);
    assert_eq!(update.evicted, vec![a_id]);
    assert!(!m.pool().contains(&a_id));
    assert!(m.pool().contains(&b_prime_id));
}

#[test]
fn test_value_conservation_per_block() {
    // Net value entering the coin set per block equals the coinbase claim:
    // subsidy plus fees, with the fees simultaneously leaving through the
    // spending transactions.
    let p = params();
    let mut cache = CoinsCache::new(StoreView::new(MemoryStore::new()).unwrap());
    cache
        .add(
            OutPoint::new([1; 32], 0),
            Coin {
                value: 10_000_000,
                lock_script: vec![0x51],
                height: 0,
                is_coinbase: false,
            },
        )
        .unwrap();

    let spend = spend_to(OutPoint::new([1; 32], 0), 9_000_000);
    let fee = 1_000_000;
    let block = build_block(
        [0; 32],
        1_000,
        vec![coinbase(block_subsidy(1, &p) + fee, 0), spend],
    );

    let mut staged = StagedBlock::new(block.clone());
    staged.check_header(1_000, &p).unwrap();
    staged.check_structure(&p).unwrap();
    staged.check_contextual(0).unwrap();
    let result = staged.connect(&mut cache, 1, &p, &StackEvaluator::new()).unwrap();

    let created: Integer = block
        .transactions
        .iter()
        .flat_map(|tx| tx.outputs.iter())
        .map(|o| o.value)
        .sum();
    let spent: Integer = result
        .undo
        .txs
        .iter()
        .flat_map(|u| u.coins.iter())
        .map(|c| c.value)
        .sum();

    assert_eq!(result.fees, fee);
    assert_eq!(created - spent, block_subsidy(1, &p));
}

#[test]
fn test_no_double_spend_across_blocks() {
    // An output consumed by one connected block cannot be consumed again.
    let mut m = engine();
    let p = params();
    let genesis = build_block([0; 32], 1_000, vec![coinbase(p.initial_subsidy, 0)]);
    let gid = genesis.block_id();
    let cb_txid = genesis.transactions[0].txid();
    m.accept_block(genesis).unwrap();
    let tip = mine_empty(&mut m, gid, p.coinbase_maturity);

    let height = m.tip().unwrap().1 + 1;
    let spend = spend_to(OutPoint::new(cb_txid, 0), p.initial_subsidy - 2_000_000);
    let first = build_block(
        tip,
        1_000 + height * 100,
        vec![coinbase(p.initial_subsidy + 2_000_000, 600), spend.clone()],
    );
    let first_id = first.block_id();
    m.accept_block(first).unwrap();

    let again = build_block(
        first_id,
        1_000 + (height + 1) * 100,
        vec![coinbase(p.initial_subsidy + 2_000_000, 601), spend],
    );
    let err = m.accept_block(again).unwrap_err();
    assert!(matches!(
        err,
        ChainstateError::Chain(ChainError::Block(BlockError::Tx {
            source: TxError::MissingInput { .. },
            ..
        }))
    ));
}

#[test]
fn test_revalidation_is_idempotent() {
    let mut m = engine();
    let p = params();
    let genesis = build_block([0; 32], 1_000, vec![coinbase(p.initial_subsidy, 0)]);
    let gid = genesis.block_id();
    m.accept_block(genesis.clone()).unwrap();
    let b1 = build_block(gid, 2_000, vec![coinbase(p.initial_subsidy, 1)]);
    m.accept_block(b1.clone()).unwrap();

    // Resubmissions settle instantly with no tip movement.
    assert_eq!(
        m.accept_block(genesis).unwrap(),
        AcceptOutcome::AlreadyKnown(gid)
    );
    assert_eq!(
        m.accept_block(b1.clone()).unwrap(),
        AcceptOutcome::AlreadyKnown(b1.block_id())
    );
    assert_eq!(m.tip(), Some((b1.block_id(), 1)));
}

#[test]
fn test_disconnected_transactions_return_to_pool() {
    // A transaction confirmed on a branch that later loses a reorg is
    // re-admitted to the pool.
    let mut m = engine();
    let p = params();
    let genesis = build_block([0; 32], 1_000, vec![coinbase(p.initial_subsidy, 0)]);
    let gid = genesis.block_id();
    let cb_txid = genesis.transactions[0].txid();
    m.accept_block(genesis).unwrap();
    let tip = mine_empty(&mut m, gid, p.coinbase_maturity);

    let height = m.tip().unwrap().1 + 1;
    let spend = spend_to(OutPoint::new(cb_txid, 0), p.initial_subsidy - 5_000_000);
    let spend_id = spend.txid();
    let a = build_block(
        tip,
        1_000 + height * 100,
        vec![coinbase(p.initial_subsidy + 5_000_000, 700), spend],
    );
    m.accept_block(a).unwrap();
    assert!(!m.pool().contains(&spend_id));

    // A heavier empty branch from the same parent displaces the block.
    let b1 = build_block(
        tip,
        1_001 + height * 100,
        vec![coinbase(p.initial_subsidy, 701)],
    );
    let b2 = build_block(
        b1.block_id(),
        1_000 + (height + 1) * 100,
        vec![coinbase(p.initial_subsidy, 702)],
    );
    m.accept_block(b1).unwrap();
    let outcome = m.accept_block(b2).unwrap();
    assert!(matches!(outcome, AcceptOutcome::Connected(_)));

    // The displaced spend is valid on the new branch too and returns.
    assert!(m.pool().contains(&spend_id));
}
