//! Aggregated discovery wire messages
//!
//! Hand-written `prost::Message` implementations matching the field numbers of
//! `envoy.service.discovery.v3` and the core types it references. Fields the
//! engine never reads (node metadata, extensions) are skipped on decode.

use prost::bytes::{Buf, BufMut};
use prost::encoding::{self, DecodeContext, WireType};
use prost::DecodeError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryRequest {
    pub version_info: String,
    pub node: Option<Node>,
    pub resource_names: Vec<String>,
    pub type_url: String,
    pub response_nonce: String,
    pub error_detail: Option<Status>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    pub version_info: String,
    pub resources: Vec<Any>,
    pub canary: bool,
    pub type_url: String,
    pub nonce: String,
    pub control_plane: Option<ControlPlane>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub cluster: String,
    pub locality: Option<Locality>,
    pub user_agent_name: String,
    pub user_agent_version: String,
    pub client_features: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Locality {
    pub region: String,
    pub zone: String,
    pub sub_zone: String,
}

/// `google.rpc.Status`, carried as the NACK error detail
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Any {
    pub type_url: String,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControlPlane {
    pub identifier: String,
}

fn merge_optional<M: prost::Message + Default>(
    slot: &mut Option<M>,
    wire_type: WireType,
    buf: &mut impl Buf,
    ctx: DecodeContext,
) -> Result<(), DecodeError> {
    let msg = slot.get_or_insert_with(M::default);
    encoding::message::merge(wire_type, msg, buf, ctx)
}

fn encode_str(tag: u32, value: &String, buf: &mut impl BufMut) {
    if !value.is_empty() {
        encoding::string::encode(tag, value, buf);
    }
}

fn str_len(tag: u32, value: &String) -> usize {
    if value.is_empty() {
        0
    } else {
        encoding::string::encoded_len(tag, value)
    }
}

impl prost::Message for DiscoveryRequest {
    fn encode_raw(&self, buf: &mut impl BufMut)
    where
        Self: Sized,
    {
        encode_str(1, &self.version_info, buf);
        if let Some(node) = &self.node {
            encoding::message::encode(2, node, buf);
        }
        encoding::string::encode_repeated(3, &self.resource_names, buf);
        encode_str(4, &self.type_url, buf);
        encode_str(5, &self.response_nonce, buf);
        if let Some(status) = &self.error_detail {
            encoding::message::encode(6, status, buf);
        }
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut impl Buf,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        match tag {
            1 => encoding::string::merge(wire_type, &mut self.version_info, buf, ctx),
            2 => merge_optional(&mut self.node, wire_type, buf, ctx),
            3 => encoding::string::merge_repeated(wire_type, &mut self.resource_names, buf, ctx),
            4 => encoding::string::merge(wire_type, &mut self.type_url, buf, ctx),
            5 => encoding::string::merge(wire_type, &mut self.response_nonce, buf, ctx),
            6 => merge_optional(&mut self.error_detail, wire_type, buf, ctx),
            _ => encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        str_len(1, &self.version_info)
            + self
                .node
                .as_ref()
                .map_or(0, |node| encoding::message::encoded_len(2, node))
            + encoding::string::encoded_len_repeated(3, &self.resource_names)
            + str_len(4, &self.type_url)
            + str_len(5, &self.response_nonce)
            + self
                .error_detail
                .as_ref()
                .map_or(0, |status| encoding::message::encoded_len(6, status))
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

impl prost::Message for DiscoveryResponse {
    fn encode_raw(&self, buf: &mut impl BufMut)
    where
        Self: Sized,
    {
        encode_str(1, &self.version_info, buf);
        encoding::message::encode_repeated(2, &self.resources, buf);
        if self.canary {
            encoding::bool::encode(3, &self.canary, buf);
        }
        encode_str(4, &self.type_url, buf);
        encode_str(5, &self.nonce, buf);
        if let Some(cp) = &self.control_plane {
            encoding::message::encode(6, cp, buf);
        }
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut impl Buf,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        match tag {
            1 => encoding::string::merge(wire_type, &mut self.version_info, buf, ctx),
            2 => encoding::message::merge_repeated(wire_type, &mut self.resources, buf, ctx),
            3 => encoding::bool::merge(wire_type, &mut self.canary, buf, ctx),
            4 => encoding::string::merge(wire_type, &mut self.type_url, buf, ctx),
            5 => encoding::string::merge(wire_type, &mut self.nonce, buf, ctx),
            6 => merge_optional(&mut self.control_plane, wire_type, buf, ctx),
            _ => encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        str_len(1, &self.version_info)
            + encoding::message::encoded_len_repeated(2, &self.resources)
            + if self.canary {
                encoding::bool::encoded_len(3, &self.canary)
            } else {
                0
            }
            + str_len(4, &self.type_url)
            + str_len(5, &self.nonce)
            + self
                .control_plane
                .as_ref()
                .map_or(0, |cp| encoding::message::encoded_len(6, cp))
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

impl prost::Message for Node {
    fn encode_raw(&self, buf: &mut impl BufMut)
    where
        Self: Sized,
    {
        encode_str(1, &self.id, buf);
        encode_str(2, &self.cluster, buf);
        if let Some(locality) = &self.locality {
            encoding::message::encode(4, locality, buf);
        }
        encode_str(6, &self.user_agent_name, buf);
        encode_str(7, &self.user_agent_version, buf);
        encoding::string::encode_repeated(10, &self.client_features, buf);
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut impl Buf,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        match tag {
            1 => encoding::string::merge(wire_type, &mut self.id, buf, ctx),
            2 => encoding::string::merge(wire_type, &mut self.cluster, buf, ctx),
            4 => merge_optional(&mut self.locality, wire_type, buf, ctx),
            6 => encoding::string::merge(wire_type, &mut self.user_agent_name, buf, ctx),
            7 => encoding::string::merge(wire_type, &mut self.user_agent_version, buf, ctx),
            10 => encoding::string::merge_repeated(wire_type, &mut self.client_features, buf, ctx),
            _ => encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        str_len(1, &self.id)
            + str_len(2, &self.cluster)
            + self
                .locality
                .as_ref()
                .map_or(0, |l| encoding::message::encoded_len(4, l))
            + str_len(6, &self.user_agent_name)
            + str_len(7, &self.user_agent_version)
            + encoding::string::encoded_len_repeated(10, &self.client_features)
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

impl prost::Message for Locality {
    fn encode_raw(&self, buf: &mut impl BufMut)
    where
        Self: Sized,
    {
        encode_str(1, &self.region, buf);
        encode_str(2, &self.zone, buf);
        encode_str(3, &self.sub_zone, buf);
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut impl Buf,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        match tag {
            1 => encoding::string::merge(wire_type, &mut self.region, buf, ctx),
            2 => encoding::string::merge(wire_type, &mut self.zone, buf, ctx),
            3 => encoding::string::merge(wire_type, &mut self.sub_zone, buf, ctx),
            _ => encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        str_len(1, &self.region) + str_len(2, &self.zone) + str_len(3, &self.sub_zone)
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

impl prost::Message for Status {
    fn encode_raw(&self, buf: &mut impl BufMut)
    where
        Self: Sized,
    {
        if self.code != 0 {
            encoding::int32::encode(1, &self.code, buf);
        }
        encode_str(2, &self.message, buf);
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut impl Buf,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        match tag {
            1 => encoding::int32::merge(wire_type, &mut self.code, buf, ctx),
            2 => encoding::string::merge(wire_type, &mut self.message, buf, ctx),
            // details (Any) are not surfaced
            _ => encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        let code = if self.code != 0 {
            encoding::int32::encoded_len(1, &self.code)
        } else {
            0
        };
        code + str_len(2, &self.message)
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

impl prost::Message for Any {
    fn encode_raw(&self, buf: &mut impl BufMut)
    where
        Self: Sized,
    {
        encode_str(1, &self.type_url, buf);
        if !self.value.is_empty() {
            encoding::bytes::encode(2, &self.value, buf);
        }
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut impl Buf,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        match tag {
            1 => encoding::string::merge(wire_type, &mut self.type_url, buf, ctx),
            2 => encoding::bytes::merge(wire_type, &mut self.value, buf, ctx),
            _ => encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        let value = if self.value.is_empty() {
            0
        } else {
            encoding::bytes::encoded_len(2, &self.value)
        };
        str_len(1, &self.type_url) + value
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

impl prost::Message for ControlPlane {
    fn encode_raw(&self, buf: &mut impl BufMut)
    where
        Self: Sized,
    {
        encode_str(1, &self.identifier, buf);
    }

    fn merge_field(
        &mut self,
        tag: u32,
        wire_type: WireType,
        buf: &mut impl Buf,
        ctx: DecodeContext,
    ) -> Result<(), DecodeError>
    where
        Self: Sized,
    {
        match tag {
            1 => encoding::string::merge(wire_type, &mut self.identifier, buf, ctx),
            _ => encoding::skip_field(wire_type, tag, buf, ctx),
        }
    }

    fn encoded_len(&self) -> usize {
        str_len(1, &self.identifier)
    }

    fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use prost::Message;

    use super::*;

    #[test]
    fn test_request_decode_matches_encode() {
        let request = DiscoveryRequest {
            version_info: "v1".to_string(),
            node: Some(Node {
                id: "sidecar~10.0.0.1~app-1.default~default.svc.cluster.local".to_string(),
                cluster: "app".to_string(),
                locality: Some(Locality {
                    region: "us-east".to_string(),
                    zone: "us-east-1a".to_string(),
                    sub_zone: String::new(),
                }),
                ..Default::default()
            }),
            resource_names: vec!["outbound|80||a.default".to_string(), "b".to_string()],
            type_url: crate::xds::ENDPOINT_TYPE.to_string(),
            response_nonce: "AAAAAAAAAAE=abc".to_string(),
            error_detail: Some(Status {
                code: 3,
                message: "bad cluster".to_string(),
            }),
        };

        let bytes = request.encode_to_vec();
        assert_eq!(bytes.len(), request.encoded_len());
        let decoded = DiscoveryRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn test_response_with_resources() {
        let response = DiscoveryResponse {
            version_info: "AAAAAAAAAAE=/2026-01-01T00:00:00Z".to_string(),
            resources: vec![Any {
                type_url: crate::xds::CLUSTER_TYPE.to_string(),
                value: b"{\"name\":\"c\"}".to_vec(),
            }],
            canary: false,
            type_url: crate::xds::CLUSTER_TYPE.to_string(),
            nonce: "n-1".to_string(),
            control_plane: Some(ControlPlane {
                identifier: "meshwire".to_string(),
            }),
        };

        let decoded = DiscoveryResponse::decode(response.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn test_empty_request_encodes_to_nothing() {
        assert_eq!(DiscoveryRequest::default().encoded_len(), 0);
    }
}
