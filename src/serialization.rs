//! Binary serialization shared by every persisted structure.
//!
//! Integers are little-endian at their declared widths; collection counts and
//! opaque blob lengths are LEB128 varints. Each top-level structure writes its
//! own version word and rejects strictly newer versions on load.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::primitives::{BlockInfo, Hash, KeyImage, PublicKey};
use crate::transfers::container::{
    OutputDetails, SpentTransferOutput, TransactionInformation, TransactionOutputInformation,
    TransferOutput,
};

const OUTPUT_TAG_KEY: u8 = 0;
const OUTPUT_TAG_MULTISIGNATURE: u8 = 1;

pub(crate) fn write_varint<W: Write>(mut writer: W, mut value: u64) -> io::Result<()> {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        writer.write_u8(byte)?;
        if value == 0 {
            return Ok(());
        }
    }
}

pub(crate) fn read_varint<R: Read>(mut reader: R) -> io::Result<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = reader.read_u8()?;
        if shift >= 64 || (shift == 63 && byte > 1) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "varint does not fit in 64 bits",
            ));
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

pub(crate) fn write_vec<W: Write, T>(
    mut writer: W,
    items: &[T],
    mut write_item: impl FnMut(&mut W, &T) -> io::Result<()>,
) -> io::Result<()> {
    write_varint(&mut writer, items.len() as u64)?;
    for item in items {
        write_item(&mut writer, item)?;
    }
    Ok(())
}

pub(crate) fn read_vec<R: Read, T>(
    mut reader: R,
    mut read_item: impl FnMut(&mut R) -> io::Result<T>,
) -> io::Result<Vec<T>> {
    let count = read_varint(&mut reader)?;
    let mut items = Vec::new();
    for _ in 0..count {
        items.push(read_item(&mut reader)?);
    }
    Ok(items)
}

pub(crate) fn write_blob<W: Write>(mut writer: W, blob: &[u8]) -> io::Result<()> {
    write_varint(&mut writer, blob.len() as u64)?;
    writer.write_all(blob)
}

pub(crate) fn read_blob<R: Read>(mut reader: R) -> io::Result<Vec<u8>> {
    let length = read_varint(&mut reader)?;
    let mut blob = vec![0u8; length as usize];
    reader.read_exact(&mut blob)?;
    Ok(blob)
}

impl BlockInfo {
    pub(crate) fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let height = reader.read_u64::<LittleEndian>()?;
        let timestamp = reader.read_u64::<LittleEndian>()?;

        Ok(Self { height, timestamp })
    }

    pub(crate) fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u64::<LittleEndian>(self.height)?;
        writer.write_u64::<LittleEndian>(self.timestamp)
    }
}

impl TransactionInformation {
    pub(crate) fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let transaction_hash = Hash::read(&mut reader)?;
        let public_key = PublicKey::read(&mut reader)?;
        let block_height = reader.read_u64::<LittleEndian>()?;
        let timestamp = reader.read_u64::<LittleEndian>()?;
        let unlock_time = reader.read_u64::<LittleEndian>()?;
        let payment_id = Hash::read(&mut reader)?;

        Ok(Self {
            transaction_hash,
            public_key,
            block_height,
            timestamp,
            unlock_time,
            payment_id,
        })
    }

    pub(crate) fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        self.transaction_hash.write(&mut writer)?;
        self.public_key.write(&mut writer)?;
        writer.write_u64::<LittleEndian>(self.block_height)?;
        writer.write_u64::<LittleEndian>(self.timestamp)?;
        writer.write_u64::<LittleEndian>(self.unlock_time)?;
        self.payment_id.write(&mut writer)
    }
}

impl TransferOutput {
    pub(crate) fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let tag = reader.read_u8()?;
        let amount = reader.read_u64::<LittleEndian>()?;
        let global_output_index = reader.read_u64::<LittleEndian>()?;
        let output_in_transaction = reader.read_u64::<LittleEndian>()?;
        let transaction_public_key = PublicKey::read(&mut reader)?;
        let unlock_time = reader.read_u64::<LittleEndian>()?;
        let block_height = reader.read_u64::<LittleEndian>()?;
        let transaction_hash = Hash::read(&mut reader)?;

        let (details, key_image) = match tag {
            OUTPUT_TAG_KEY => {
                let output_key = PublicKey::read(&mut reader)?;
                let key_image = KeyImage::read(&mut reader)?;
                (OutputDetails::Key { output_key }, Some(key_image))
            }
            OUTPUT_TAG_MULTISIGNATURE => {
                let required_signatures = reader.read_u32::<LittleEndian>()?;
                (
                    OutputDetails::Multisignature {
                        required_signatures,
                    },
                    None,
                )
            }
            tag => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("invalid output type tag {tag}"),
                ));
            }
        };

        Ok(Self {
            information: TransactionOutputInformation {
                amount,
                global_output_index,
                output_in_transaction,
                transaction_public_key,
                details,
            },
            key_image,
            unlock_time,
            block_height,
            transaction_hash,
        })
    }

    pub(crate) fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let tag = match self.information.details {
            OutputDetails::Key { .. } => OUTPUT_TAG_KEY,
            OutputDetails::Multisignature { .. } => OUTPUT_TAG_MULTISIGNATURE,
        };
        writer.write_u8(tag)?;
        writer.write_u64::<LittleEndian>(self.information.amount)?;
        writer.write_u64::<LittleEndian>(self.information.global_output_index)?;
        writer.write_u64::<LittleEndian>(self.information.output_in_transaction)?;
        self.information.transaction_public_key.write(&mut writer)?;
        writer.write_u64::<LittleEndian>(self.unlock_time)?;
        writer.write_u64::<LittleEndian>(self.block_height)?;
        self.transaction_hash.write(&mut writer)?;

        match self.information.details {
            OutputDetails::Key { output_key } => {
                output_key.write(&mut writer)?;
                self.key_image
                    .expect("key outputs always carry a key image")
                    .write(&mut writer)
            }
            OutputDetails::Multisignature {
                required_signatures,
            } => writer.write_u32::<LittleEndian>(required_signatures),
        }
    }
}

impl SpentTransferOutput {
    pub(crate) fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        let output = TransferOutput::read(&mut reader)?;
        let spending_block = BlockInfo::read(&mut reader)?;
        let spending_transaction_hash = Hash::read(&mut reader)?;
        let input_in_transaction = reader.read_u64::<LittleEndian>()?;

        Ok(Self {
            output,
            spending_block,
            spending_transaction_hash,
            input_in_transaction,
        })
    }

    pub(crate) fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        self.output.write(&mut writer)?;
        self.spending_block.write(&mut writer)?;
        self.spending_transaction_hash.write(&mut writer)?;
        writer.write_u64::<LittleEndian>(self.input_in_transaction)
    }
}

#[cfg(test)]
mod tests {
    use rand::Rng;

    use super::*;

    #[test]
    fn varint_round_trips() {
        let mut values = vec![0u64, 1, 127, 128, 16_383, 16_384, u64::MAX];
        let mut rng = rand::thread_rng();
        for _ in 0..64 {
            values.push(rng.r#gen());
        }

        for value in values {
            let mut buffer = Vec::new();
            write_varint(&mut buffer, value).unwrap();
            assert_eq!(read_varint(&mut buffer.as_slice()).unwrap(), value);
        }
    }

    #[test]
    fn varint_rejects_overlong_encoding() {
        // eleven continuation bytes encode more than 64 bits
        let buffer = [0xffu8; 11];
        assert!(read_varint(&mut buffer.as_slice()).is_err());
    }

    #[test]
    fn blob_round_trips() {
        let blob: Vec<u8> = (0..=255).collect();
        let mut buffer = Vec::new();
        write_blob(&mut buffer, &blob).unwrap();
        assert_eq!(read_blob(&mut buffer.as_slice()).unwrap(), blob);
    }
}
