use vaultd_consensus::Hash256;
use vaultd_primitives::encoding::{decode_all, encode_to_vec, DecodeError, Decoder};
use vaultd_primitives::outpoint::OutPoint;
use vaultd_primitives::transaction::{Transaction, TxIn, TxOut};
use vaultd_primitives::block::{Block, BlockHeader};

struct Lcg {
    state: u64,
}

impl Lcg {
    fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_mul(6364136223846793005).wrapping_add(1);
        self.state
    }

    fn next_u32(&mut self) -> u32 {
        self.next_u64() as u32
    }

    fn next_u8(&mut self) -> u8 {
        self.next_u64() as u8
    }

    fn gen_range(&mut self, max: usize) -> usize {
        if max == 0 {
            0
        } else {
            (self.next_u64() % max as u64) as usize
        }
    }
}

fn random_hash(rng: &mut Lcg) -> Hash256 {
    std::array::from_fn(|_| rng.next_u8())
}

fn random_script(rng: &mut Lcg, max_len: usize) -> Vec<u8> {
    let len = rng.gen_range(max_len + 1);
    (0..len).map(|_| rng.next_u8()).collect()
}

fn random_transaction(rng: &mut Lcg) -> Transaction {
    let input_count = rng.gen_range(4) + 1;
    let output_count = rng.gen_range(4) + 1;
    Transaction {
        version: 1,
        inputs: (0..input_count)
            .map(|_| TxIn {
                prevout: OutPoint::new(random_hash(rng), rng.next_u32() % 16),
                script_sig: random_script(rng, 120),
                sequence: rng.next_u32(),
            })
            .collect(),
        outputs: (0..output_count)
            .map(|_| TxOut {
                value: (rng.next_u64() % 1_000_000_000) as i64,
                script_pubkey: random_script(rng, 40),
            })
            .collect(),
        lock_time: rng.next_u32(),
    }
}

#[test]
fn transactions_roundtrip() {
    let mut rng = Lcg::new(0x5eed);
    for _ in 0..200 {
        let tx = random_transaction(&mut rng);
        let bytes = encode_to_vec(&tx);
        let decoded: Transaction = decode_all(&bytes).expect("decode");
        assert_eq!(decoded, tx);
        assert_eq!(decoded.txid(), tx.txid());
    }
}

#[test]
fn blocks_roundtrip() {
    let mut rng = Lcg::new(0xb10c);
    for _ in 0..50 {
        let tx_count = rng.gen_range(5);
        let block = Block {
            header: BlockHeader {
                version: 1,
                prev_block: random_hash(&mut rng),
                merkle_root: random_hash(&mut rng),
                time: rng.next_u32(),
                bits: rng.next_u32(),
                nonce: rng.next_u32(),
            },
            transactions: (0..tx_count).map(|_| random_transaction(&mut rng)).collect(),
        };
        let bytes = encode_to_vec(&block);
        let decoded: Block = decode_all(&bytes).expect("decode");
        assert_eq!(decoded, block);
        assert_eq!(decoded.hash(), block.hash());
    }
}

#[test]
fn truncated_input_is_an_error() {
    let mut rng = Lcg::new(0x7e57);
    let tx = random_transaction(&mut rng);
    let bytes = encode_to_vec(&tx);
    for cut in [1, bytes.len() / 2, bytes.len() - 1] {
        let result: Result<Transaction, DecodeError> = decode_all(&bytes[..cut]);
        assert!(result.is_err(), "truncation at {cut} must fail");
    }
}

#[test]
fn trailing_bytes_are_an_error() {
    let mut rng = Lcg::new(0xdead);
    let tx = random_transaction(&mut rng);
    let mut bytes = encode_to_vec(&tx);
    bytes.push(0x00);
    let result: Result<Transaction, DecodeError> = decode_all(&bytes);
    assert_eq!(result, Err(DecodeError::TrailingBytes));
}

#[test]
fn decoder_tracks_remaining() {
    let payload = [1u8, 2, 3, 4];
    let mut decoder = Decoder::new(&payload);
    assert_eq!(decoder.remaining(), 4);
    decoder.read_u16_le().expect("u16");
    assert_eq!(decoder.remaining(), 2);
    decoder.read_u16_le().expect("u16");
    assert!(decoder.is_empty());
}
