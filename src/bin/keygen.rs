//! Whirlpool Key Generation Tool
//!
//! Generates the node's long-lived key material:
//! - X25519 keypair (64 bytes, priv || pub) clients seal init messages to
//! - Server key (32 bytes) shared with the metaserver for the token seal
//!
//! Usage:
//!   cargo run --bin keygen -- --name "node-frankfurt" --output ./keys/
//!
//! The output includes the environment exports the node and the metaserver
//! consume, plus the public key clients embed in their connection links.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use clap::Parser;
use std::fs;
use std::path::PathBuf;
use whirlpool::crypto::{Asymmetric, Symmetric};
use whirlpool::proto::packet_pool;

#[derive(Parser)]
#[command(name = "keygen", version, about = "Whirlpool Node Key Generator")]
struct Args {
    /// Node name (for documentation)
    #[arg(short, long)]
    name: String,

    /// Output directory for keys
    #[arg(short, long, default_value = ".")]
    output: PathBuf,
}

fn main() {
    let args = Args::parse();

    println!("════════════════════════════════════════════════════════════");
    println!("  Whirlpool Node Key Generator");
    println!("════════════════════════════════════════════════════════════");
    println!();
    println!("Generating key material for: {}", args.name);
    println!();

    let node_key = Asymmetric::generate();
    let keypair_bytes = node_key.to_bytes().expect("generated key has a private scalar");
    let (server_key, server_cipher) = Symmetric::generate();

    fs::create_dir_all(&args.output).expect("Failed to create output directory");

    let keypair_path = args.output.join(format!("{}_keypair.key", args.name));
    fs::write(&keypair_path, keypair_bytes).expect("Failed to write keypair");
    println!("X25519 keypair saved to: {}", keypair_path.display());
    println!("  Size: {} bytes (priv || pub)", keypair_bytes.len());
    println!();

    let server_path = args.output.join(format!("{}_server.key", args.name));
    fs::write(&server_path, server_key).expect("Failed to write server key");
    println!("Server key saved to: {}", server_path.display());
    println!("  Size: {} bytes", server_key.len());
    println!();

    println!("════════════════════════════════════════════════════════════");
    println!("  Environment (node side)");
    println!("════════════════════════════════════════════════════════════");
    println!();
    println!("export SEASIDE_PRIVATE_KEY={}", BASE64.encode(keypair_bytes));
    println!("export SEASIDE_SERVER_KEY={}", BASE64.encode(server_key));
    println!();
    println!("Public key (for client connection links):");
    println!("  {}", BASE64.encode(node_key.public_key()));
    println!("Fingerprint: {}", hex::encode(&node_key.public_key()[..8]));
    println!();

    // Verification test: seal to the public half, open with the keypair.
    println!("════════════════════════════════════════════════════════════");
    println!("  Verification Test");
    println!("════════════════════════════════════════════════════════════");
    println!();

    let pool = packet_pool();
    let public_only = Asymmetric::from_bytes(&node_key.public_key()).expect("public key parses");
    let test_message = b"whirlpool key generation self-test";

    let mut plain = pool.get(test_message.len()).expect("pool allocation");
    plain.slice_mut().copy_from_slice(test_message);
    let (sealed_key, sealed) = public_only.encrypt(plain).expect("asymmetric seal");
    match node_key.decrypt(sealed) {
        Ok((opened_key, opened)) if opened.slice() == test_message && opened_key == sealed_key => {
            println!("  Asymmetric roundtrip: PASSED");
        }
        _ => {
            println!("  Asymmetric roundtrip: FAILED");
            std::process::exit(1);
        }
    }

    let mut plain = pool.get(test_message.len()).expect("pool allocation");
    plain.slice_mut().copy_from_slice(test_message);
    let sealed = server_cipher.encrypt(plain, None).expect("symmetric seal");
    match server_cipher.decrypt(sealed, None) {
        Ok(opened) if opened.slice() == test_message => println!("  Server key roundtrip: PASSED"),
        _ => {
            println!("  Server key roundtrip: FAILED");
            std::process::exit(1);
        }
    }
    println!();

    println!("════════════════════════════════════════════════════════════");
    println!("  SECURITY INSTRUCTIONS");
    println!("════════════════════════════════════════════════════════════");
    println!();
    println!("1. Store {}_keypair.key and {}_server.key in encrypted storage", args.name, args.name);
    println!("2. Never commit key files to version control");
    println!("3. Hand SEASIDE_SERVER_KEY to the metaserver only over an");
    println!("   authenticated channel; it seals every viridian token");
    println!("4. Publish only the public key to clients");
    println!();
}
