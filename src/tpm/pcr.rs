use thiserror::Error;

/// PCRs every TPM this crate talks to implements.
pub const NUM_PCRS: u32 = 24;
/// Bytes of a selection bitmap covering all [`NUM_PCRS`].
pub const PCR_SELECT_SIZE: usize = (NUM_PCRS / 8) as usize;

#[derive(Error, Debug, PartialEq)]
pub enum PcrError {
    #[error("PCR {0} is out of range")]
    OutOfRange(u32),
    #[error("PCR selection is {0} bytes, expected {PCR_SELECT_SIZE}")]
    SelectionSize(usize),
    #[error("PCR selection does not select exactly PCR {0}")]
    SelectionMismatch(u32),
}

pub type Result<T, E = PcrError> = core::result::Result<T, E>;

/// Selection bitmap with only `pcr_index` set: `byte[i / 8] = 1 << (i % 8)`.
pub fn pcr_select(pcr_index: u32) -> Result<Vec<u8>> {
    if pcr_index >= NUM_PCRS {
        return Err(PcrError::OutOfRange(pcr_index));
    }
    let mut select = vec![0u8; PCR_SELECT_SIZE];
    select[(pcr_index / 8) as usize] = 1 << (pcr_index % 8);
    Ok(select)
}

/// Accepts a [`PCR_SELECT_SIZE`] bitmap only if it selects `pcr_index` and
/// nothing else.
pub fn check_single_selection(select: &[u8], pcr_index: u32) -> Result<()> {
    if pcr_index >= NUM_PCRS {
        return Err(PcrError::OutOfRange(pcr_index));
    }
    if select.len() != PCR_SELECT_SIZE {
        return Err(PcrError::SelectionSize(select.len()));
    }
    let byte = (pcr_index / 8) as usize;
    let exact = select.iter().enumerate().all(|(i, b)| {
        if i == byte {
            *b == 1 << (pcr_index % 8)
        } else {
            *b == 0
        }
    });
    match exact {
        true => Ok(()),
        false => Err(PcrError::SelectionMismatch(pcr_index)),
    }
}
