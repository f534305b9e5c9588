//! Envelope schema for messages exchanged between peers.
//!
//! An [`Envelope`] is a closed set of variants; exactly one is present by
//! construction. On the wire it is a map with a single key naming the
//! variant, so a peer can tell which variant arrived without any outside
//! context. The nested [`DataRef`] and [`ModelRef`] unions use the same
//! single-key shape.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::WireError;

/// Service a peer can be paid for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Service {
    /// Model inference with proof of execution
    Inference,
}

impl Service {
    /// Wire name of the service
    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Inference => "inference",
        }
    }
}

impl From<Service> for String {
    fn from(service: Service) -> Self {
        service.as_str().to_string()
    }
}

impl TryFrom<String> for Service {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "inference" => Ok(Service::Inference),
            other => Err(format!("unknown service {:?}", other)),
        }
    }
}

/// IPFS-style content link used by data and model references
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpfsLink {
    /// Content identifier resolved outside this layer
    pub cid: String,
}

/// Reference to a binary blob: inline bytes or a content identifier
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawDataRef", into = "RawDataRef")]
pub enum DataRef {
    /// Raw bytes carried in the envelope
    Inline(Bytes),
    /// Content stored elsewhere, named by its content identifier
    Ipfs {
        /// Content identifier
        cid: String,
    },
}

impl DataRef {
    /// Inline bytes, if this reference carries them
    pub fn as_inline(&self) -> Option<&Bytes> {
        match self {
            DataRef::Inline(bytes) => Some(bytes),
            DataRef::Ipfs { .. } => None,
        }
    }

    /// Short form for logs: inline length or the content identifier
    pub fn describe(&self) -> String {
        match self {
            DataRef::Inline(bytes) => format!("{} inline bytes", bytes.len()),
            DataRef::Ipfs { cid } => format!("ipfs:{}", cid),
        }
    }
}

impl From<Bytes> for DataRef {
    fn from(bytes: Bytes) -> Self {
        DataRef::Inline(bytes)
    }
}

#[derive(Serialize, Deserialize)]
struct RawDataRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Bytes>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ipfs: Option<IpfsLink>,
}

impl From<DataRef> for RawDataRef {
    fn from(data_ref: DataRef) -> Self {
        match data_ref {
            DataRef::Inline(bytes) => RawDataRef {
                data: Some(bytes),
                ipfs: None,
            },
            DataRef::Ipfs { cid } => RawDataRef {
                data: None,
                ipfs: Some(IpfsLink { cid }),
            },
        }
    }
}

impl TryFrom<RawDataRef> for DataRef {
    type Error = String;

    fn try_from(raw: RawDataRef) -> Result<Self, Self::Error> {
        match (raw.data, raw.ipfs) {
            (Some(bytes), None) => Ok(DataRef::Inline(bytes)),
            (None, Some(link)) => Ok(DataRef::Ipfs { cid: link.cid }),
            (Some(_), Some(_)) => Err("data reference sets both data and ipfs".to_string()),
            (None, None) => Err("data reference sets neither data nor ipfs".to_string()),
        }
    }
}

/// Remote repository coordinate for a model
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HuggingFaceRepo {
    /// Namespace
    pub user: String,
    /// Repository name
    pub model: String,
}

/// Which model a request or claim refers to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawModelRef", into = "RawModelRef")]
pub enum ModelRef {
    /// Short symbolic id, e.g. `mnist`
    Id(String),
    /// Remote repository coordinate
    HuggingFace {
        /// Namespace
        user: String,
        /// Repository name
        model: String,
    },
    /// Content identifier of the model artifact
    Ipfs {
        /// Content identifier
        cid: String,
    },
}

impl ModelRef {
    /// The symbolic id, if this is the id form
    pub fn as_id(&self) -> Option<&str> {
        match self {
            ModelRef::Id(id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelRef::Id(id) => write!(f, "id:{}", id),
            ModelRef::HuggingFace { user, model } => write!(f, "huggingface:{}/{}", user, model),
            ModelRef::Ipfs { cid } => write!(f, "ipfs:{}", cid),
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RawModelRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    huggingface: Option<HuggingFaceRepo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    ipfs: Option<IpfsLink>,
}

impl From<ModelRef> for RawModelRef {
    fn from(model: ModelRef) -> Self {
        let mut raw = RawModelRef {
            id: None,
            huggingface: None,
            ipfs: None,
        };
        match model {
            ModelRef::Id(id) => raw.id = Some(id),
            ModelRef::HuggingFace { user, model } => {
                raw.huggingface = Some(HuggingFaceRepo { user, model })
            }
            ModelRef::Ipfs { cid } => raw.ipfs = Some(IpfsLink { cid }),
        }
        raw
    }
}

impl TryFrom<RawModelRef> for ModelRef {
    type Error = String;

    fn try_from(raw: RawModelRef) -> Result<Self, Self::Error> {
        match (raw.id, raw.huggingface, raw.ipfs) {
            (Some(id), None, None) => Ok(ModelRef::Id(id)),
            (None, Some(repo), None) => Ok(ModelRef::HuggingFace {
                user: repo.user,
                model: repo.model,
            }),
            (None, None, Some(link)) => Ok(ModelRef::Ipfs { cid: link.cid }),
            _ => Err("model reference must set exactly one of id, huggingface, ipfs".to_string()),
        }
    }
}

/// Ask a peer for an invoice before requesting a paid service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRequest {
    /// Requested service
    pub service: Service,
}

/// Lightning payment details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitcoinLightning {
    /// LNURL to pay
    pub lnurl: String,
    /// Amount in satoshis
    pub amount: u64,
}

/// Payment options and expiry of an invoice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceDetails {
    /// Lightning payment option
    pub bitcoin_lightning: BitcoinLightning,
    /// Expiry as a unix timestamp (milliseconds)
    pub expired_at: u64,
}

/// Invoice issued in answer to an [`InvoiceRequest`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    /// Service the invoice pays for
    pub service: Service,
    /// Invoice identifier, echoed back in `invoice_fulfilled`
    pub invoice_id: String,
    /// Payment details
    pub invoice: InvoiceDetails,
}

/// Claim that a public model produced `output` from a private input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateInputClaim {
    /// Model that was run
    pub model: ModelRef,
    /// Model output
    pub output: DataRef,
    /// Proof of execution
    pub proof: DataRef,
}

/// Claim that a private model produced `output` from a public input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateModelClaim {
    /// Model input
    pub input: DataRef,
    /// Model output
    pub output: DataRef,
    /// Proof of execution
    pub proof: DataRef,
}

/// Result of an inference request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceOutput {
    /// Correlation id copied from the request
    pub task_id: String,
    /// Witness holding the model outputs
    pub witness: DataRef,
    /// Proof of inference
    pub proof: DataRef,
    /// Verifying key for `proof`
    pub verifying_key: DataRef,
}

/// Reference to a paid invoice
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceFulfilled {
    /// Invoice identifier
    pub invoice_id: String,
}

/// Request to run a model on an input and prove it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InferenceRequest {
    /// Correlation id chosen by the requester
    pub task_id: String,
    /// Model input
    pub input: DataRef,
    /// Model to run
    pub model: ModelRef,
    /// Structured reference string for proving
    pub srs: DataRef,
    /// Paid invoice, when the service is not free
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_fulfilled: Option<InvoiceFulfilled>,
}

/// Envelope variant names
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnvelopeKind {
    /// `invoice_request`
    InvoiceRequest,
    /// `invoice`
    Invoice,
    /// `private_input_claim`
    PrivateInputClaim,
    /// `private_model_claim`
    PrivateModelClaim,
    /// `inference_output`
    InferenceOutput,
    /// `inference_request`
    InferenceRequest,
}

impl EnvelopeKind {
    /// Wire name of the variant
    pub fn as_str(&self) -> &'static str {
        match self {
            EnvelopeKind::InvoiceRequest => "invoice_request",
            EnvelopeKind::Invoice => "invoice",
            EnvelopeKind::PrivateInputClaim => "private_input_claim",
            EnvelopeKind::PrivateModelClaim => "private_model_claim",
            EnvelopeKind::InferenceOutput => "inference_output",
            EnvelopeKind::InferenceRequest => "inference_request",
        }
    }
}

impl fmt::Display for EnvelopeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The unit exchanged over a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Invoice request
    InvoiceRequest(InvoiceRequest),
    /// Invoice
    Invoice(Invoice),
    /// Private-input claim
    PrivateInputClaim(PrivateInputClaim),
    /// Private-model claim
    PrivateModelClaim(PrivateModelClaim),
    /// Inference output
    InferenceOutput(InferenceOutput),
    /// Inference request
    InferenceRequest(InferenceRequest),
}

impl Envelope {
    /// Which variant this envelope carries
    pub fn kind(&self) -> EnvelopeKind {
        match self {
            Envelope::InvoiceRequest(_) => EnvelopeKind::InvoiceRequest,
            Envelope::Invoice(_) => EnvelopeKind::Invoice,
            Envelope::PrivateInputClaim(_) => EnvelopeKind::PrivateInputClaim,
            Envelope::PrivateModelClaim(_) => EnvelopeKind::PrivateModelClaim,
            Envelope::InferenceOutput(_) => EnvelopeKind::InferenceOutput,
            Envelope::InferenceRequest(_) => EnvelopeKind::InferenceRequest,
        }
    }

    /// Correlation id for variants that carry one
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Envelope::InferenceOutput(output) => Some(&output.task_id),
            Envelope::InferenceRequest(request) => Some(&request.task_id),
            _ => None,
        }
    }
}

impl From<InferenceRequest> for Envelope {
    fn from(request: InferenceRequest) -> Self {
        Envelope::InferenceRequest(request)
    }
}

impl From<InferenceOutput> for Envelope {
    fn from(output: InferenceOutput) -> Self {
        Envelope::InferenceOutput(output)
    }
}

impl From<InvoiceRequest> for Envelope {
    fn from(request: InvoiceRequest) -> Self {
        Envelope::InvoiceRequest(request)
    }
}

impl From<Invoice> for Envelope {
    fn from(invoice: Invoice) -> Self {
        Envelope::Invoice(invoice)
    }
}

/// Wire shape of an envelope: every variant optional, one expected
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invoice_request: Option<InvoiceRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    invoice: Option<Invoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_input_claim: Option<PrivateInputClaim>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    private_model_claim: Option<PrivateModelClaim>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inference_output: Option<InferenceOutput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    inference_request: Option<InferenceRequest>,
}

impl RawEnvelope {
    fn populated(&self) -> usize {
        [
            self.invoice_request.is_some(),
            self.invoice.is_some(),
            self.private_input_claim.is_some(),
            self.private_model_claim.is_some(),
            self.inference_output.is_some(),
            self.inference_request.is_some(),
        ]
        .iter()
        .filter(|present| **present)
        .count()
    }
}

impl From<Envelope> for RawEnvelope {
    fn from(envelope: Envelope) -> Self {
        let mut raw = RawEnvelope::default();
        match envelope {
            Envelope::InvoiceRequest(v) => raw.invoice_request = Some(v),
            Envelope::Invoice(v) => raw.invoice = Some(v),
            Envelope::PrivateInputClaim(v) => raw.private_input_claim = Some(v),
            Envelope::PrivateModelClaim(v) => raw.private_model_claim = Some(v),
            Envelope::InferenceOutput(v) => raw.inference_output = Some(v),
            Envelope::InferenceRequest(v) => raw.inference_request = Some(v),
        }
        raw
    }
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = WireError;

    fn try_from(raw: RawEnvelope) -> Result<Self, Self::Error> {
        let populated = raw.populated();
        if populated != 1 {
            return Err(WireError::UnknownOrEmptyEnvelope(populated));
        }

        let envelope = if let Some(v) = raw.invoice_request {
            Envelope::InvoiceRequest(v)
        } else if let Some(v) = raw.invoice {
            Envelope::Invoice(v)
        } else if let Some(v) = raw.private_input_claim {
            Envelope::PrivateInputClaim(v)
        } else if let Some(v) = raw.private_model_claim {
            Envelope::PrivateModelClaim(v)
        } else if let Some(v) = raw.inference_output {
            Envelope::InferenceOutput(v)
        } else if let Some(v) = raw.inference_request {
            Envelope::InferenceRequest(v)
        } else {
            return Err(WireError::UnknownOrEmptyEnvelope(0));
        };

        Ok(envelope)
    }
}
