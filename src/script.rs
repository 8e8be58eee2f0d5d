//! Script verification seam and built-in stack evaluator
//!
//! Validation treats the evaluator as a pure, possibly expensive black
//! box behind [`ScriptVerifier`]. The built-in [`StackEvaluator`] covers a
//! compact opcode set: data pushes, stack shuffling, hash locks, and ECDSA
//! signature checks.

use ripemd::Ripemd160;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1};
use sha2::{Digest, Sha256};

use crate::types::{ByteString, Integer, Transaction};

/// Maximum script length accepted by the evaluator
const MAX_SCRIPT_SIZE: usize = 10_000;

/// Maximum stack depth during evaluation
const MAX_STACK_SIZE: usize = 1_000;

/// Maximum executed operations per script
const MAX_SCRIPT_OPS: usize = 201;

/// Everything a verifier may need about the spending transaction
#[derive(Debug, Clone, Copy)]
pub struct TxContext<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    /// Value of the coin being spent
    pub value: Integer,
}

/// External script/crypto evaluator
///
/// `verify` must be a pure function of its arguments: no side effects, no
/// mutation of validation state. Malformed scripts evaluate to `false`.
pub trait ScriptVerifier {
    fn verify(&self, lock_script: &[u8], witness: &[u8], ctx: &TxContext<'_>) -> bool;
}

/// Built-in stack-machine evaluator
#[derive(Debug, Default)]
pub struct StackEvaluator;

impl StackEvaluator {
    pub fn new() -> Self {
        Self
    }
}

impl ScriptVerifier for StackEvaluator {
    /// Run the witness, then the locking script, over one shared stack.
    /// Satisfied when exactly one truthy value remains.
    fn verify(&self, lock_script: &[u8], witness: &[u8], ctx: &TxContext<'_>) -> bool {
        if lock_script.len() > MAX_SCRIPT_SIZE || witness.len() > MAX_SCRIPT_SIZE {
            return false;
        }

        let mut stack: Vec<ByteString> = Vec::new();
        if !eval_script(witness, &mut stack, ctx) {
            return false;
        }
        if !eval_script(lock_script, &mut stack, ctx) {
            return false;
        }
        stack.len() == 1 && is_truthy(&stack[0])
    }
}

fn is_truthy(item: &[u8]) -> bool {
    item.iter().any(|&b| b != 0)
}

/// Execute one script over the given stack.
fn eval_script(script: &[u8], stack: &mut Vec<ByteString>, ctx: &TxContext<'_>) -> bool {
    let mut pc = 0;
    let mut op_count = 0;

    while pc < script.len() {
        op_count += 1;
        if op_count > MAX_SCRIPT_OPS || stack.len() > MAX_STACK_SIZE {
            return false;
        }

        let opcode = script[pc];
        pc += 1;

        match opcode {
            // Push empty array
            0x00 => stack.push(vec![]),

            // Direct data push of 1..=75 bytes
            0x01..=0x4b => {
                let len = opcode as usize;
                if pc + len > script.len() {
                    return false;
                }
                stack.push(script[pc..pc + len].to_vec());
                pc += len;
            }

            // Push numbers 1..=16
            0x51..=0x60 => stack.push(vec![opcode - 0x50]),

            // VERIFY: top item must be truthy
            0x69 => match stack.pop() {
                Some(item) if is_truthy(&item) => {}
                _ => return false,
            },

            // RETURN: unconditional failure
            0x6a => return false,

            // DROP
            0x75 => {
                if stack.pop().is_none() {
                    return false;
                }
            }

            // DUP
            0x76 => match stack.last().cloned() {
                Some(item) => stack.push(item),
                None => return false,
            },

            // EQUAL
            0x87 => {
                if stack.len() < 2 {
                    return false;
                }
                let a = stack.pop().expect("checked len");
                let b = stack.pop().expect("checked len");
                stack.push(if a == b { vec![1] } else { vec![] });
            }

            // EQUALVERIFY
            0x88 => {
                if stack.len() < 2 {
                    return false;
                }
                let a = stack.pop().expect("checked len");
                let b = stack.pop().expect("checked len");
                if a != b {
                    return false;
                }
            }

            // HASH160: RIPEMD160(SHA256(x))
            0xa9 => match stack.pop() {
                Some(item) => {
                    let sha = Sha256::digest(&item);
                    stack.push(Ripemd160::digest(sha).to_vec());
                }
                None => return false,
            },

            // HASH256: SHA256(SHA256(x))
            0xaa => match stack.pop() {
                Some(item) => {
                    let first = Sha256::digest(&item);
                    stack.push(Sha256::digest(first).to_vec());
                }
                None => return false,
            },

            // CHECKSIG: pops pubkey then signature, pushes the verdict
            0xac => {
                if stack.len() < 2 {
                    return false;
                }
                let pubkey = stack.pop().expect("checked len");
                let signature = stack.pop().expect("checked len");
                let ok = check_signature(&pubkey, &signature, ctx);
                stack.push(if ok { vec![1] } else { vec![] });
            }

            // CHECKSIGVERIFY
            0xad => {
                if stack.len() < 2 {
                    return false;
                }
                let pubkey = stack.pop().expect("checked len");
                let signature = stack.pop().expect("checked len");
                if !check_signature(&pubkey, &signature, ctx) {
                    return false;
                }
            }

            _ => return false,
        }
    }

    true
}

/// ECDSA check over the transaction's signature digest for this input.
/// DER signatures are tried first, 64-byte compact encoding second.
fn check_signature(pubkey: &[u8], signature: &[u8], ctx: &TxContext<'_>) -> bool {
    let pubkey = match PublicKey::from_slice(pubkey) {
        Ok(pk) => pk,
        Err(_) => return false,
    };
    let signature = match Signature::from_der(signature)
        .or_else(|_| Signature::from_compact(signature))
    {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    let digest = ctx.tx.sighash(ctx.input_index);
    let message = Message::from_digest(digest);

    let secp = Secp256k1::verification_only();
    secp.verify_ecdsa(&message, &signature, &pubkey).is_ok()
}
