use std::fmt;

/// Layer of the bridge's on-chain revert-code space.
///
/// Each layer owns a contiguous code window starting at [`RevertLayer::base`].
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RevertLayer {
    Btp,
    Bmc,
    Bmv,
    Bsh,
    Reserved,
}

impl RevertLayer {
    /// Returns the first code of the layer.
    #[must_use]
    pub const fn base(self) -> u32 {
        match self {
            RevertLayer::Btp => 0,
            RevertLayer::Bmc => 10,
            RevertLayer::Bmv => 25,
            RevertLayer::Bsh => 40,
            RevertLayer::Reserved => 55,
        }
    }

    /// Returns the layer owning `code`.
    #[must_use]
    pub const fn of(code: u32) -> Self {
        match code {
            0..10 => RevertLayer::Btp,
            10..25 => RevertLayer::Bmc,
            25..40 => RevertLayer::Bmv,
            40..55 => RevertLayer::Bsh,
            _ => RevertLayer::Reserved,
        }
    }

    const fn label(self) -> &'static str {
        match self {
            RevertLayer::Btp => "BTPRevert",
            RevertLayer::Bmc => "BMCRevert",
            RevertLayer::Bmv => "BMVRevert",
            RevertLayer::Bsh => "BSHRevert",
            RevertLayer::Reserved => "ReservedRevert",
        }
    }
}

macro_rules! revert_codes {
    (
        $(#[$meta:meta])*
        $name:ident, $layer:expr, {
            $($variant:ident = $code:literal => $label:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
        pub enum $name {
            $($variant,)+
            /// A code inside the layer without a registered name.
            Unknown(u32),
        }

        impl $name {
            #[must_use]
            pub const fn from_code(code: u32) -> Self {
                match code {
                    $($code => $name::$variant,)+
                    other => $name::Unknown(other),
                }
            }

            #[must_use]
            pub const fn code(self) -> u32 {
                match self {
                    $($name::$variant => $code,)+
                    $name::Unknown(code) => code,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                match self {
                    $($name::$variant => f.write_str($label),)+
                    $name::Unknown(code) => write!(f, "{}[{}]", $layer.label(), code),
                }
            }
        }
    };
}

revert_codes! {
    /// Bridge-Manager (BMC) revert codes.
    BmcRevert, RevertLayer::Bmc, {
        Revert = 10 => "BMCRevert",
        Unauthorized = 11 => "BMCRevertUnauthorized",
        InvalidSequence = 12 => "BMCRevertInvalidSN",
        AlreadyExistsBmv = 13 => "BMCRevertAlreadyExistsBMV",
        NotExistsBmv = 14 => "BMCRevertNotExistsBMV",
        AlreadyExistsBsh = 15 => "BMCRevertAlreadyExistsBSH",
        NotExistsBsh = 16 => "BMCRevertNotExistsBSH",
        AlreadyExistsLink = 17 => "BMCRevertAlreadyExistsLink",
        NotExistsLink = 18 => "BMCRevertNotExistsLink",
        Unreachable = 19 => "BMCRevertUnreachable",
        NotExistsPermission = 20 => "BMCRevertNotExistsPermission",
    }
}

revert_codes! {
    /// Bridge-Verifier (BMV) revert codes.
    BmvRevert, RevertLayer::Bmv, {
        Revert = 25 => "BMVRevert",
        InvalidMpt = 26 => "BMVRevertInvalidMPT",
        InvalidVotes = 27 => "BMVRevertInvalidVotes",
        InvalidSequence = 28 => "BMVRevertInvalidSequence",
        InvalidBlockUpdate = 29 => "BMVRevertInvalidBlockUpdate",
        InvalidBlockProof = 30 => "BMVRevertInvalidBlockProof",
        InvalidBlockWitness = 31 => "BMVRevertInvalidBlockWitness",
        InvalidSequenceHigher = 32 => "BMVRevertInvalidSequenceHigher",
        InvalidBlockUpdateHigher = 33 => "BMVRevertInvalidBlockUpdateHigher",
        InvalidBlockUpdateLower = 34 => "BMVRevertInvalidBlockUpdateLower",
        InvalidBlockProofHigher = 35 => "BMVRevertInvalidBlockProofHigher",
        InvalidBlockWitnessOld = 36 => "BMVRevertInvalidBlockWitnessOld",
    }
}

/// A deterministic contract-level rejection, tagged by layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RevertCode {
    Btp(u32),
    Bmc(BmcRevert),
    Bmv(BmvRevert),
    Bsh(u32),
    Reserved(u32),
}

impl RevertCode {
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        match RevertLayer::of(code) {
            RevertLayer::Btp => RevertCode::Btp(code),
            RevertLayer::Bmc => RevertCode::Bmc(BmcRevert::from_code(code)),
            RevertLayer::Bmv => RevertCode::Bmv(BmvRevert::from_code(code)),
            RevertLayer::Bsh => RevertCode::Bsh(code),
            RevertLayer::Reserved => RevertCode::Reserved(code),
        }
    }

    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            RevertCode::Btp(code) | RevertCode::Bsh(code) | RevertCode::Reserved(code) => code,
            RevertCode::Bmc(bmc) => bmc.code(),
            RevertCode::Bmv(bmv) => bmv.code(),
        }
    }

    #[must_use]
    pub const fn layer(self) -> RevertLayer {
        match self {
            RevertCode::Btp(_) => RevertLayer::Btp,
            RevertCode::Bmc(_) => RevertLayer::Bmc,
            RevertCode::Bmv(_) => RevertLayer::Bmv,
            RevertCode::Bsh(_) => RevertLayer::Bsh,
            RevertCode::Reserved(_) => RevertLayer::Reserved,
        }
    }
}

impl fmt::Display for RevertCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RevertCode::Bmc(bmc) => fmt::Display::fmt(bmc, f),
            RevertCode::Bmv(bmv) => fmt::Display::fmt(bmv, f),
            RevertCode::Btp(code) | RevertCode::Bsh(code) | RevertCode::Reserved(code) => {
                write!(f, "{}[{}]", self.layer().label(), code)
            }
        }
    }
}
