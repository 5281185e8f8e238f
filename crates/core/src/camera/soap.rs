//! SOAP 1.2 envelopes for the ONVIF media and PTZ services.
//!
//! Every request carries a WS-Security `UsernameToken` with a password
//! digest (ONVIF Core §5.12):
//!
//! ```text
//! Digest = Base64( SHA-1( nonce ‖ created ‖ password ) )
//! ```
//!
//! where `nonce` is the raw random bytes (sent Base64-encoded) and
//! `created` is the UTC creation time as sent in `wsu:Created`. A fresh
//! nonce is generated per request, so no handshake state survives a call.

use std::fmt::Write as _;

use base64::prelude::{BASE64_STANDARD, Engine as _};
use quick_xml::Reader;
use quick_xml::escape::escape;
use quick_xml::events::Event;
use sha1::{Digest, Sha1};

use crate::camera::{Credentials, StreamType, TransportProtocol, Velocity};
use crate::error::CameraError;

pub const MEDIA_GET_STREAM_URI: &str = "http://www.onvif.org/ver10/media/wsdl/GetStreamUri";
pub const PTZ_CONTINUOUS_MOVE: &str = "http://www.onvif.org/ver20/ptz/wsdl/ContinuousMove";
pub const PTZ_STOP: &str = "http://www.onvif.org/ver20/ptz/wsdl/Stop";

const NS_SOAP: &str = "http://www.w3.org/2003/05/soap-envelope";
const NS_MEDIA: &str = "http://www.onvif.org/ver10/media/wsdl";
const NS_PTZ: &str = "http://www.onvif.org/ver20/ptz/wsdl";
const NS_SCHEMA: &str = "http://www.onvif.org/ver10/schema";
const NS_WSSE: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
const NS_WSU: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
const PASSWORD_DIGEST: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-username-token-profile-1.0#PasswordDigest";
const BASE64_BINARY: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-soap-message-security-1.0#Base64Binary";

/// `Base64(SHA-1(nonce ‖ created ‖ password))`.
pub fn password_digest(nonce: &[u8], created: &str, password: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(nonce);
    hasher.update(created.as_bytes());
    hasher.update(password.as_bytes());
    BASE64_STANDARD.encode(hasher.finalize())
}

/// A WS-Security UsernameToken ready to be serialized.
#[derive(Debug, Clone)]
pub struct UsernameToken {
    pub username: String,
    pub nonce: String,
    pub created: String,
    pub digest: String,
}

impl UsernameToken {
    /// Build a token with a fresh 16-byte nonce and the current UTC time.
    pub fn new(credentials: &Credentials) -> Self {
        let nonce: [u8; 16] = rand::random();
        let created = chrono::Utc::now()
            .format("%Y-%m-%dT%H:%M:%S%.3fZ")
            .to_string();
        Self::with_nonce(credentials, &nonce, created)
    }

    pub fn with_nonce(credentials: &Credentials, nonce: &[u8], created: String) -> Self {
        Self {
            username: credentials.username.clone(),
            nonce: BASE64_STANDARD.encode(nonce),
            digest: password_digest(nonce, &created, &credentials.password),
            created,
        }
    }

    fn write_header(&self, out: &mut String) {
        let _ = write!(
            out,
            "<s:Header>\
             <wsse:Security s:mustUnderstand=\"1\" xmlns:wsse=\"{NS_WSSE}\" xmlns:wsu=\"{NS_WSU}\">\
             <wsse:UsernameToken>\
             <wsse:Username>{}</wsse:Username>\
             <wsse:Password Type=\"{PASSWORD_DIGEST}\">{}</wsse:Password>\
             <wsse:Nonce EncodingType=\"{BASE64_BINARY}\">{}</wsse:Nonce>\
             <wsu:Created>{}</wsu:Created>\
             </wsse:UsernameToken>\
             </wsse:Security>\
             </s:Header>",
            escape(self.username.as_str()),
            self.digest,
            self.nonce,
            self.created,
        );
    }
}

/// Wrap `body` in a SOAP envelope with a WS-Security header.
pub fn envelope(token: &UsernameToken, body: &str) -> String {
    let mut out = String::with_capacity(1024 + body.len());
    let _ = write!(
        out,
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\
         <s:Envelope xmlns:s=\"{NS_SOAP}\" xmlns:trt=\"{NS_MEDIA}\" \
         xmlns:tptz=\"{NS_PTZ}\" xmlns:tt=\"{NS_SCHEMA}\">"
    );
    token.write_header(&mut out);
    let _ = write!(out, "<s:Body>{body}</s:Body></s:Envelope>");
    out
}

pub fn get_stream_uri_body(
    profile_token: &str,
    stream: StreamType,
    protocol: TransportProtocol,
) -> String {
    format!(
        "<trt:GetStreamUri>\
         <trt:StreamSetup>\
         <tt:Stream>{}</tt:Stream>\
         <tt:Transport><tt:Protocol>{}</tt:Protocol></tt:Transport>\
         </trt:StreamSetup>\
         <trt:ProfileToken>{}</trt:ProfileToken>\
         </trt:GetStreamUri>",
        stream.as_str(),
        protocol.as_str(),
        escape(profile_token),
    )
}

pub fn continuous_move_body(profile_token: &str, velocity: Velocity) -> String {
    format!(
        "<tptz:ContinuousMove>\
         <tptz:ProfileToken>{}</tptz:ProfileToken>\
         <tptz:Velocity><tt:PanTilt x=\"{}\" y=\"{}\"/></tptz:Velocity>\
         </tptz:ContinuousMove>",
        escape(profile_token),
        velocity.pan,
        velocity.tilt,
    )
}

pub fn stop_body(profile_token: &str) -> String {
    format!(
        "<tptz:Stop>\
         <tptz:ProfileToken>{}</tptz:ProfileToken>\
         <tptz:PanTilt>true</tptz:PanTilt>\
         <tptz:Zoom>true</tptz:Zoom>\
         </tptz:Stop>",
        escape(profile_token),
    )
}

/// What a response body carried, by local element name.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ResponseScan {
    /// Text of `MediaUri/Uri`.
    pub uri: Option<String>,
    /// Set when the body contains a `Fault`; holds the best reason found.
    pub fault: Option<String>,
}

/// Scan a SOAP response for a stream URI or a fault.
///
/// Matches on local names so any namespace prefix the camera picks works.
/// SOAP 1.2 faults report `Reason/Text`, falling back to the innermost
/// `Code`/`Subcode` `Value`; SOAP 1.1 faults report `faultstring`.
pub fn scan_response(xml: &str) -> Result<ResponseScan, CameraError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut path: Vec<String> = Vec::new();
    let mut scan = ResponseScan::default();
    let mut in_fault = false;
    let mut reason: Option<String> = None;
    let mut code: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if name == "Fault" {
                    in_fault = true;
                }
                path.push(name);
            }
            Ok(Event::End(_)) => {
                path.pop();
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| CameraError::Xml(e.to_string()))?
                    .into_owned();
                let current = path.last().map(String::as_str);
                let parent = path.len().checked_sub(2).map(|i| path[i].as_str());
                match (current, parent) {
                    (Some("Uri"), Some("MediaUri")) => scan.uri = Some(text),
                    (Some("Text"), Some("Reason")) | (Some("faultstring"), _) if in_fault => {
                        reason = Some(text)
                    }
                    (Some("Value"), _) if in_fault => code = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(CameraError::Xml(e.to_string())),
        }
    }

    if in_fault {
        scan.fault = Some(
            reason
                .or(code)
                .unwrap_or_else(|| "unspecified fault".to_string()),
        );
    }
    Ok(scan)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds() -> Credentials {
        Credentials::new("admin", "pw")
    }

    #[test]
    fn digest_matches_onvif_reference_vector() {
        let nonce = BASE64_STANDARD.decode("LKqI6G/AikKCQrN0zqZFlg==").unwrap();
        let digest = password_digest(&nonce, "2010-09-16T07:50:45Z", "userpassword");
        assert_eq!(digest, "tuOSpGlFlIXsozq4HFNeeGeFLEI=");
    }

    #[test]
    fn fresh_tokens_use_fresh_nonces() {
        let a = UsernameToken::new(&creds());
        let b = UsernameToken::new(&creds());
        assert_ne!(a.nonce, b.nonce);
        assert_eq!(BASE64_STANDARD.decode(&a.nonce).unwrap().len(), 16);
        assert!(a.created.ends_with('Z'));
    }

    #[test]
    fn envelope_carries_security_header() {
        let token = UsernameToken::with_nonce(&creds(), b"0123456789abcdef", "2024-01-01T00:00:00Z".into());
        let xml = envelope(&token, &get_stream_uri_body("Profile_1", StreamType::RtpUnicast, TransportProtocol::Rtsp));

        assert!(xml.contains("<wsse:Username>admin</wsse:Username>"));
        assert!(xml.contains(&format!(">{}</wsse:Password>", token.digest)));
        assert!(xml.contains("#PasswordDigest"));
        assert!(xml.contains("<wsu:Created>2024-01-01T00:00:00Z</wsu:Created>"));
        assert!(xml.contains("<tt:Stream>RTP-Unicast</tt:Stream>"));
        assert!(xml.contains("<tt:Protocol>RTSP</tt:Protocol>"));
        assert!(xml.contains("<trt:ProfileToken>Profile_1</trt:ProfileToken>"));
        assert!(!xml.contains("pw<"));
    }

    #[test]
    fn username_is_escaped() {
        let token = UsernameToken::with_nonce(
            &Credentials::new("a<b&c", "pw"),
            b"nonce",
            "2024-01-01T00:00:00Z".into(),
        );
        let xml = envelope(&token, "");
        assert!(xml.contains("<wsse:Username>a&lt;b&amp;c</wsse:Username>"));
    }

    #[test]
    fn move_body_has_velocity() {
        let body = continuous_move_body("Profile_1", Velocity::new(-0.5, 0.0));
        assert!(body.contains("<tt:PanTilt x=\"-0.5\" y=\"0\"/>"));
    }

    #[test]
    fn scan_finds_stream_uri() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<SOAP-ENV:Envelope xmlns:SOAP-ENV="http://www.w3.org/2003/05/soap-envelope"
    xmlns:trt="http://www.onvif.org/ver10/media/wsdl" xmlns:tt="http://www.onvif.org/ver10/schema">
  <SOAP-ENV:Body>
    <trt:GetStreamUriResponse>
      <trt:MediaUri>
        <tt:Uri>rtsp://10.0.0.5:554/Streaming/Channels/101?transportmode=unicast&amp;profile=Profile_1</tt:Uri>
        <tt:InvalidAfterConnect>false</tt:InvalidAfterConnect>
        <tt:Timeout>PT0S</tt:Timeout>
      </trt:MediaUri>
    </trt:GetStreamUriResponse>
  </SOAP-ENV:Body>
</SOAP-ENV:Envelope>"#;

        let scan = scan_response(xml).unwrap();
        assert_eq!(
            scan.uri.as_deref(),
            Some("rtsp://10.0.0.5:554/Streaming/Channels/101?transportmode=unicast&profile=Profile_1")
        );
        assert_eq!(scan.fault, None);
    }

    #[test]
    fn scan_reports_soap12_fault_reason() {
        let xml = r#"<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope"
    xmlns:ter="http://www.onvif.org/ver10/error">
  <env:Body>
    <env:Fault>
      <env:Code>
        <env:Value>env:Sender</env:Value>
        <env:Subcode><env:Value>ter:NotAuthorized</env:Value></env:Subcode>
      </env:Code>
      <env:Reason><env:Text xml:lang="en">Sender not Authorized</env:Text></env:Reason>
    </env:Fault>
  </env:Body>
</env:Envelope>"#;

        let scan = scan_response(xml).unwrap();
        assert_eq!(scan.fault.as_deref(), Some("Sender not Authorized"));
        assert_eq!(scan.uri, None);
    }

    #[test]
    fn scan_falls_back_to_fault_code() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><s:Fault>
<s:Code><s:Value>s:Receiver</s:Value><s:Subcode><s:Value>ter:NoProfile</s:Value></s:Subcode></s:Code>
</s:Fault></s:Body></s:Envelope>"#;

        let scan = scan_response(xml).unwrap();
        assert_eq!(scan.fault.as_deref(), Some("ter:NoProfile"));
    }

    #[test]
    fn scan_rejects_malformed_xml() {
        assert!(matches!(
            scan_response("<a><b></a>"),
            Err(CameraError::Xml(_))
        ));
    }

    #[test]
    fn scan_of_empty_move_response() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"><s:Body><tptz:ContinuousMoveResponse xmlns:tptz="http://www.onvif.org/ver20/ptz/wsdl"/></s:Body></s:Envelope>"#;
        assert_eq!(scan_response(xml).unwrap(), ResponseScan::default());
    }
}
