use base64::{
    Engine,
    engine::general_purpose::STANDARD as BASE64,
};
use serde::{
    Deserialize,
    Serialize,
};
use sha2::{
    Digest,
    Sha256,
};
use solana_pubkey::Pubkey;
use std::{
    fmt,
    str::FromStr,
};

pub const DEFAULT_PROGRAM_ID: &str = "2F2K73Sj1ygx4N9ptCegrxEDvGNLCndrsCdmUbcHej3c";
pub const SYSTEM_PROGRAM_ID: &str = "11111111111111111111111111111111";

const DISCRIMINATOR_LEN: usize = 8;
const GAME_DATA_ACCOUNT_NAME: &str = "GameDataAccount";

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum ProgramError {
    #[error("invalid address {0:?}: expected a base58 32-byte key")]
    InvalidAddress(String),
    #[error("{0} requires a signer")]
    MissingSigner(InstructionKind),
}

#[derive(Clone, Debug, thiserror::Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("account data too short: {len} bytes, need {needed}")]
    TooShort { len: usize, needed: usize },
    #[error("account discriminator mismatch: not a GameDataAccount")]
    Discriminator,
}

/// 32-byte ledger key, shown and parsed as base58.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(Pubkey);

impl FromStr for Address {
    type Err = ProgramError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Pubkey::from_str(s)
            .map(Self)
            .map_err(|_| ProgramError::InvalidAddress(s.to_string()))
    }
}

impl TryFrom<String> for Address {
    type Error = ProgramError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.0.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Seed the program uses for the shared game account of `level`.
pub fn level_seed(level: u8) -> String {
    format!("level{level}")
}

/// Program-derived address of the shared game account for `level`.
pub fn level_game_account(program_id: &Address, level: u8) -> (Address, u8) {
    let seed = level_seed(level);
    let (key, bump) = Pubkey::find_program_address(&[seed.as_bytes()], &program_id.0);
    (Address(key), bump)
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Signature(String);

impl Signature {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum InstructionKind {
    Initialize,
    MoveLeft,
    MoveRight,
}

impl InstructionKind {
    pub const ALL: [InstructionKind; 3] = [
        InstructionKind::Initialize,
        InstructionKind::MoveLeft,
        InstructionKind::MoveRight,
    ];

    /// Name the relay endpoint expects in `{"instruction": ...}`.
    pub fn relay_name(self) -> &'static str {
        match self {
            InstructionKind::Initialize => "initialize",
            InstructionKind::MoveLeft => "moveLeft",
            InstructionKind::MoveRight => "moveRight",
        }
    }

    pub fn method_name(self) -> &'static str {
        match self {
            InstructionKind::Initialize => "initialize",
            InstructionKind::MoveLeft => "move_left",
            InstructionKind::MoveRight => "move_right",
        }
    }

    pub fn discriminator(self) -> [u8; DISCRIMINATOR_LEN] {
        discriminator("global", self.method_name())
    }
}

impl fmt::Display for InstructionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.relay_name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountMeta {
    pub pubkey: Address,
    pub is_signer: bool,
    pub is_writable: bool,
}

impl AccountMeta {
    fn writable(pubkey: Address) -> Self {
        Self {
            pubkey,
            is_signer: false,
            is_writable: true,
        }
    }

    fn readonly(pubkey: Address) -> Self {
        Self {
            pubkey,
            is_signer: false,
            is_writable: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Instruction {
    #[serde(skip)]
    pub kind: InstructionKind,
    pub program_id: Address,
    pub accounts: Vec<AccountMeta>,
    #[serde(serialize_with = "serialize_base64")]
    pub data: Vec<u8>,
}

/// Envelope handed to the wallet for signing and broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub fee_payer: Address,
    pub recent_blockhash: String,
    pub last_valid_block_height: u64,
    pub instructions: Vec<Instruction>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GameDataAccount {
    pub player_position: u8,
}

impl GameDataAccount {
    pub const LEN: usize = DISCRIMINATOR_LEN + 1;

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < Self::LEN {
            return Err(DecodeError::TooShort {
                len: data.len(),
                needed: Self::LEN,
            });
        }
        if data[..DISCRIMINATOR_LEN] != account_discriminator() {
            return Err(DecodeError::Discriminator);
        }
        Ok(Self {
            player_position: data[DISCRIMINATOR_LEN],
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut data = account_discriminator().to_vec();
        data.push(self.player_position);
        data
    }
}

pub fn account_discriminator() -> [u8; DISCRIMINATOR_LEN] {
    discriminator("account", GAME_DATA_ACCOUNT_NAME)
}

/// Builds the instruction for `kind` against the game account. Pure.
pub fn build_instruction(
    kind: InstructionKind,
    program_id: &Address,
    game_account: &Address,
    signer: Option<&Address>,
) -> Result<Instruction, ProgramError> {
    let accounts = match kind {
        InstructionKind::Initialize => {
            let signer = signer.ok_or(ProgramError::MissingSigner(kind))?;
            vec![
                AccountMeta::writable(game_account.clone()),
                AccountMeta {
                    pubkey: signer.clone(),
                    is_signer: true,
                    is_writable: true,
                },
                AccountMeta::readonly(system_program_id()),
            ]
        }
        InstructionKind::MoveLeft | InstructionKind::MoveRight => {
            vec![AccountMeta::writable(game_account.clone())]
        }
    };
    Ok(Instruction {
        kind,
        program_id: program_id.clone(),
        accounts,
        data: kind.discriminator().to_vec(),
    })
}

pub fn system_program_id() -> Address {
    Address(Pubkey::new_from_array([0u8; 32]))
}

fn discriminator(namespace: &str, name: &str) -> [u8; DISCRIMINATOR_LEN] {
    let digest = Sha256::digest(format!("{namespace}:{name}").as_bytes());
    let mut out = [0u8; DISCRIMINATOR_LEN];
    out.copy_from_slice(&digest[..DISCRIMINATOR_LEN]);
    out
}

fn serialize_base64<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&BASE64.encode(data))
}
