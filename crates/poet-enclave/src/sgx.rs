//! SGX attestation structures.
//!
//! Byte-exact little-endian encodings of the C structures found in an SGX
//! quote. Field widths and order must match `sgx_report.h` / `sgx_quote.h`
//! exactly, otherwise quotes produced by real hardware will not parse.
//!
//! ```text
//! sgx_quote_t (432 fixed bytes)
//! ┌─────────┬───────────┬───────────────┬────────┬─────────┬──────────────┐
//! │ version │ sign_type │ epid_group_id │ qe_svn │ pce_svn │ ext_group_id │
//! │   u16   │    u16    │     [4]       │  u16   │   u16   │     u32      │
//! ├─────────┴───────────┴───────────────┴────────┴─────────┴──────────────┤
//! │ basename [32]                                                         │
//! ├───────────────────────────────────────────────────────────────────────┤
//! │ report_body [384]                                                     │
//! └───────────────────────────────────────────────────────────────────────┘
//!   optional: signature_len u32, signature [signature_len]
//! ```

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SgxStructError {
    #[error("{name}: expected {expected} bytes, got {actual}")]
    SizeMismatch {
        name: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("{name}: buffer too short, need at least {minimum} bytes, got {actual}")]
    BufferTooShort {
        name: &'static str,
        minimum: usize,
        actual: usize,
    },

    #[error("{name}: {reason}")]
    Malformed { name: &'static str, reason: String },
}

pub type SgxResult<T> = Result<T, SgxStructError>;

/// Sequential little-endian reader over a byte slice
pub struct Reader<'a> {
    buffer: &'a [u8],
    position: usize,
    name: &'static str,
}

impl<'a> Reader<'a> {
    fn new(buffer: &'a [u8], name: &'static str) -> Self {
        Self {
            buffer,
            position: 0,
            name,
        }
    }

    fn remaining(&self) -> usize {
        self.buffer.len() - self.position
    }

    fn bytes(&mut self, count: usize) -> SgxResult<&'a [u8]> {
        if self.remaining() < count {
            return Err(SgxStructError::BufferTooShort {
                name: self.name,
                minimum: self.position + count,
                actual: self.buffer.len(),
            });
        }
        let slice = &self.buffer[self.position..self.position + count];
        self.position += count;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> SgxResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(N)?);
        Ok(out)
    }

    fn skip(&mut self, count: usize) -> SgxResult<()> {
        self.bytes(count).map(|_| ())
    }

    fn u16(&mut self) -> SgxResult<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> SgxResult<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn u64(&mut self) -> SgxResult<u64> {
        Ok(u64::from_le_bytes(self.array()?))
    }
}

/// A fixed-size SGX structure
pub trait SgxStruct: Sized {
    const STRUCT_SIZE: usize;
    const NAME: &'static str;

    fn write_to(&self, out: &mut Vec<u8>);

    fn read_from(reader: &mut Reader<'_>) -> SgxResult<Self>;

    fn serialize_to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::STRUCT_SIZE);
        self.write_to(&mut out);
        out
    }

    /// Parse from a buffer of exactly `STRUCT_SIZE` bytes
    fn parse_from_bytes(buffer: &[u8]) -> SgxResult<Self> {
        if buffer.len() != Self::STRUCT_SIZE {
            return Err(SgxStructError::SizeMismatch {
                name: Self::NAME,
                expected: Self::STRUCT_SIZE,
                actual: buffer.len(),
            });
        }
        Self::read_from(&mut Reader::new(buffer, Self::NAME))
    }
}

macro_rules! byte_array_struct {
    ($(#[$doc:meta])* $name:ident, $field:ident, $size:expr, $c_name:expr) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name {
            pub $field: [u8; $size],
        }

        impl Default for $name {
            fn default() -> Self {
                Self { $field: [0u8; $size] }
            }
        }

        impl SgxStruct for $name {
            const STRUCT_SIZE: usize = $size;
            const NAME: &'static str = $c_name;

            fn write_to(&self, out: &mut Vec<u8>) {
                out.extend_from_slice(&self.$field);
            }

            fn read_from(reader: &mut Reader<'_>) -> SgxResult<Self> {
                Ok(Self { $field: reader.array()? })
            }
        }
    };
}

byte_array_struct!(
    /// `sgx_cpu_svn_t`
    SgxCpuSvn, svn, 16, "sgx_cpu_svn_t"
);
byte_array_struct!(
    /// `sgx_measurement_t` (MRENCLAVE / MRSIGNER)
    SgxMeasurement, m, 32, "sgx_measurement_t"
);
byte_array_struct!(
    /// `sgx_report_data_t`
    SgxReportData, d, 64, "sgx_report_data_t"
);
byte_array_struct!(
    /// `sgx_key_id_t`
    SgxKeyId, id, 32, "sgx_key_id_t"
);
byte_array_struct!(
    /// `sgx_basename_t`
    SgxBasename, name, 32, "sgx_basename_t"
);

/// `sgx_attributes_t`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SgxAttributes {
    pub flags: u64,
    pub xfrm: u64,
}

impl SgxStruct for SgxAttributes {
    const STRUCT_SIZE: usize = 16;
    const NAME: &'static str = "sgx_attributes_t";

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.flags.to_le_bytes());
        out.extend_from_slice(&self.xfrm.to_le_bytes());
    }

    fn read_from(reader: &mut Reader<'_>) -> SgxResult<Self> {
        Ok(Self {
            flags: reader.u64()?,
            xfrm: reader.u64()?,
        })
    }
}

/// `sgx_report_body_t`. Reserved regions are written as zeros.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SgxReportBody {
    pub cpu_svn: SgxCpuSvn,
    pub misc_select: u32,
    pub attributes: SgxAttributes,
    pub mr_enclave: SgxMeasurement,
    pub mr_signer: SgxMeasurement,
    pub isv_prod_id: u16,
    pub isv_svn: u16,
    pub report_data: SgxReportData,
}

impl SgxStruct for SgxReportBody {
    const STRUCT_SIZE: usize = 384;
    const NAME: &'static str = "sgx_report_body_t";

    fn write_to(&self, out: &mut Vec<u8>) {
        self.cpu_svn.write_to(out);
        out.extend_from_slice(&self.misc_select.to_le_bytes());
        out.extend_from_slice(&[0u8; 28]);
        self.attributes.write_to(out);
        self.mr_enclave.write_to(out);
        out.extend_from_slice(&[0u8; 32]);
        self.mr_signer.write_to(out);
        out.extend_from_slice(&[0u8; 96]);
        out.extend_from_slice(&self.isv_prod_id.to_le_bytes());
        out.extend_from_slice(&self.isv_svn.to_le_bytes());
        out.extend_from_slice(&[0u8; 60]);
        self.report_data.write_to(out);
    }

    fn read_from(reader: &mut Reader<'_>) -> SgxResult<Self> {
        let cpu_svn = SgxCpuSvn::read_from(reader)?;
        let misc_select = reader.u32()?;
        reader.skip(28)?;
        let attributes = SgxAttributes::read_from(reader)?;
        let mr_enclave = SgxMeasurement::read_from(reader)?;
        reader.skip(32)?;
        let mr_signer = SgxMeasurement::read_from(reader)?;
        reader.skip(96)?;
        let isv_prod_id = reader.u16()?;
        let isv_svn = reader.u16()?;
        reader.skip(60)?;
        let report_data = SgxReportData::read_from(reader)?;
        Ok(Self {
            cpu_svn,
            misc_select,
            attributes,
            mr_enclave,
            mr_signer,
            isv_prod_id,
            isv_svn,
            report_data,
        })
    }
}

/// `sgx_report_t`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SgxReport {
    pub body: SgxReportBody,
    pub key_id: SgxKeyId,
    pub mac: [u8; 16],
}

impl SgxStruct for SgxReport {
    const STRUCT_SIZE: usize = 432;
    const NAME: &'static str = "sgx_report_t";

    fn write_to(&self, out: &mut Vec<u8>) {
        self.body.write_to(out);
        self.key_id.write_to(out);
        out.extend_from_slice(&self.mac);
    }

    fn read_from(reader: &mut Reader<'_>) -> SgxResult<Self> {
        Ok(Self {
            body: SgxReportBody::read_from(reader)?,
            key_id: SgxKeyId::read_from(reader)?,
            mac: reader.array()?,
        })
    }
}

/// `sgx_quote_t`: 432 fixed bytes, optionally followed by a signature
/// length and signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SgxQuote {
    pub version: u16,
    pub sign_type: u16,
    pub epid_group_id: [u8; 4],
    pub qe_svn: u16,
    pub pce_svn: u16,
    pub extended_epid_group_id: u32,
    pub basename: SgxBasename,
    pub report_body: SgxReportBody,
    /// `None` when the quote carries no signature length at all
    pub signature: Option<Vec<u8>>,
}

impl SgxQuote {
    pub const FIXED_STRUCT_SIZE: usize = 432;
    const NAME: &'static str = "sgx_quote_t";

    pub fn serialize_to_bytes(&self) -> Vec<u8> {
        let signature_size = self.signature.as_ref().map_or(0, |s| 4 + s.len());
        let mut out = Vec::with_capacity(Self::FIXED_STRUCT_SIZE + signature_size);
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.sign_type.to_le_bytes());
        out.extend_from_slice(&self.epid_group_id);
        out.extend_from_slice(&self.qe_svn.to_le_bytes());
        out.extend_from_slice(&self.pce_svn.to_le_bytes());
        out.extend_from_slice(&self.extended_epid_group_id.to_le_bytes());
        self.basename.write_to(&mut out);
        self.report_body.write_to(&mut out);
        if let Some(signature) = &self.signature {
            out.extend_from_slice(&(signature.len() as u32).to_le_bytes());
            out.extend_from_slice(signature);
        }
        out
    }

    pub fn parse_from_bytes(buffer: &[u8]) -> SgxResult<Self> {
        if buffer.len() < Self::FIXED_STRUCT_SIZE {
            return Err(SgxStructError::BufferTooShort {
                name: Self::NAME,
                minimum: Self::FIXED_STRUCT_SIZE,
                actual: buffer.len(),
            });
        }

        let mut reader = Reader::new(buffer, Self::NAME);
        let mut quote = Self {
            version: reader.u16()?,
            sign_type: reader.u16()?,
            epid_group_id: reader.array()?,
            qe_svn: reader.u16()?,
            pce_svn: reader.u16()?,
            extended_epid_group_id: reader.u32()?,
            basename: SgxBasename::read_from(&mut reader)?,
            report_body: SgxReportBody::read_from(&mut reader)?,
            signature: None,
        };

        match reader.remaining() {
            0 => {}
            1..=3 => {
                return Err(SgxStructError::Malformed {
                    name: Self::NAME,
                    reason: "partial signature length".to_string(),
                })
            }
            _ => {
                let signature_len = reader.u32()? as usize;
                if reader.remaining() != signature_len {
                    return Err(SgxStructError::Malformed {
                        name: Self::NAME,
                        reason: format!(
                            "signature length {} does not match remaining {} bytes",
                            signature_len,
                            reader.remaining()
                        ),
                    });
                }
                quote.signature = Some(reader.bytes(signature_len)?.to_vec());
            }
        }

        Ok(quote)
    }
}
