use {
    rand::{Rng, SeedableRng, rngs::StdRng},
    solana_sdk::{
        hash::Hash,
        instruction::{AccountMeta, Instruction},
        pubkey::Pubkey,
        signature::Keypair,
        signer::Signer,
        system_instruction,
        transaction::Transaction,
    },
    yellowstone_sender::{
        blockhash_cache::Blockhash,
        builder::{BuildError, build_with_blockhash, sign},
        encoding::{self, MalformedData},
    },
};

fn assert_same_bytes(instructions: &[Instruction], payer: &Keypair, signers: &[&dyn Signer]) {
    let hash = Hash::new_unique();
    let unsigned = build_with_blockhash(&payer.pubkey(), instructions, Blockhash::new(hash, 1_000))
        .expect("build");
    let signed = sign(unsigned, signers).expect("sign");
    let ours = encoding::encode(signed.transaction()).expect("encode");

    let theirs =
        Transaction::new_signed_with_payer(instructions, Some(&payer.pubkey()), signers, hash);
    assert_eq!(ours, bincode::serialize(&theirs).expect("bincode"));
    assert_eq!(signed.signature(), theirs.signatures[0]);

    let decoded: Transaction = bincode::deserialize(&ours).expect("sdk decode");
    decoded.verify().expect("signatures verify");
    assert_eq!(encoding::decode(&ours).expect("decode"), *signed.transaction());
}

#[test]
fn transfer_matches_sdk_layout() {
    let payer = Keypair::new();
    let instructions = [system_instruction::transfer(
        &payer.pubkey(),
        &Pubkey::new_unique(),
        42,
    )];
    assert_same_bytes(&instructions, &payer, &[&payer]);
}

#[test]
fn multi_signer_multi_program_matches_sdk_layout() {
    let payer = Keypair::new();
    let authority = Keypair::new();
    let program = Pubkey::new_unique();
    let shared = Pubkey::new_unique();
    let instructions = [
        Instruction::new_with_bytes(
            program,
            &[1, 2, 3],
            vec![
                AccountMeta::new_readonly(authority.pubkey(), true),
                AccountMeta::new_readonly(shared, false),
                AccountMeta::new(Pubkey::new_unique(), false),
            ],
        ),
        system_instruction::transfer(&payer.pubkey(), &shared, 7),
    ];
    assert_same_bytes(&instructions, &payer, &[&payer, &authority]);
}

/// Random instruction sets signed by a random subset of keypairs.
fn random_instructions(
    rng: &mut StdRng,
    payer: &Keypair,
    keypairs: &[Keypair],
) -> (Vec<Instruction>, Vec<usize>) {
    let programs = (0..rng.gen_range(1..=3))
        .map(|_| Pubkey::new_unique())
        .collect::<Vec<_>>();
    let others = (0..rng.gen_range(0..=6))
        .map(|_| Pubkey::new_unique())
        .collect::<Vec<_>>();

    let mut signing = vec![];
    let instructions = (0..rng.gen_range(1..=4))
        .map(|_| {
            let program_id = programs[rng.gen_range(0..programs.len())];
            let accounts = (0..rng.gen_range(0..=5))
                .map(|_| {
                    let is_writable = rng.gen_bool(0.5);
                    match rng.gen_range(0..3) {
                        0 => AccountMeta {
                            pubkey: payer.pubkey(),
                            is_signer: rng.gen_bool(0.5),
                            is_writable,
                        },
                        1 if !keypairs.is_empty() => {
                            let index = rng.gen_range(0..keypairs.len());
                            let is_signer = rng.gen_bool(0.7);
                            if is_signer && !signing.contains(&index) {
                                signing.push(index);
                            }
                            AccountMeta {
                                pubkey: keypairs[index].pubkey(),
                                is_signer,
                                is_writable,
                            }
                        }
                        _ if !others.is_empty() => AccountMeta {
                            pubkey: others[rng.gen_range(0..others.len())],
                            is_signer: false,
                            is_writable,
                        },
                        _ => AccountMeta::new(Pubkey::new_unique(), false),
                    }
                })
                .collect();
            let data = (0..rng.gen_range(0..=64))
                .map(|_| rng.r#gen::<u8>())
                .collect::<Vec<_>>();
            Instruction::new_with_bytes(program_id, &data, accounts)
        })
        .collect();
    (instructions, signing)
}

#[test]
fn random_transactions_round_trip() {
    let mut rng = StdRng::seed_from_u64(0x5e4d);
    let keypairs = (0..4).map(|_| Keypair::new()).collect::<Vec<_>>();

    let mut checked = 0;
    for _ in 0..200 {
        let payer = Keypair::new();
        let available = rng.gen_range(0..=keypairs.len());
        let (instructions, signing) = random_instructions(&mut rng, &payer, &keypairs[..available]);

        let blockhash = Blockhash::new(Hash::new_unique(), rng.gen_range(0..1_000_000));
        let unsigned = match build_with_blockhash(&payer.pubkey(), &instructions, blockhash) {
            Ok(unsigned) => unsigned,
            Err(BuildError::Malformed(MalformedData::TooLarge { .. })) => continue,
            Err(error) => panic!("build failed: {error}"),
        };
        let mut signers: Vec<&dyn Signer> = vec![&payer];
        signers.extend(signing.iter().map(|index| &keypairs[*index] as &dyn Signer));
        let signed = sign(unsigned, &signers).expect("sign");

        let bytes = encoding::encode(signed.transaction()).expect("encode");
        let decoded = encoding::decode(&bytes).expect("decode");
        assert_eq!(decoded, *signed.transaction());
        assert_eq!(decoded.signatures[0], signed.signature());
        assert_eq!(decoded.message.recent_blockhash, blockhash.hash());
        decoded.verify().expect("signatures verify");
        assert_eq!(
            bytes,
            bincode::serialize(&Transaction::new_signed_with_payer(
                &instructions,
                Some(&payer.pubkey()),
                signers.as_slice(),
                blockhash.hash(),
            ))
            .expect("bincode")
        );
        checked += 1;
    }
    assert!(checked > 150, "only {checked} transactions fit a packet");
}
