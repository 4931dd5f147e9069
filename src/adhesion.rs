//! Membership applications: identity papers plus a signed contract, pending admin review
use super::error::ValidationError;
use super::identity::UserId;
use super::listing::{TimeStamp, non_empty};
use chrono::Utc;

pub const CONTRACT_TERMS: &str = "\
This contract binds the member to GP Express for transport and delivery missions.
By signing, the member accepts the terms of use, the code of conduct and the
transmission of their supporting documents for identity checks.

1. Confidentiality
2. Accuracy of the documents provided
3. Liability for lost or damaged goods
4. Validity: 12 months
5. Termination";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Passport,
    Housing,
    Status,
}

impl DocumentKind {
    pub fn folder(&self) -> &'static str {
        match self {
            DocumentKind::Passport => "passport",
            DocumentKind::Housing => "housing",
            DocumentKind::Status => "status",
        }
    }
}

/// A file picked by the applicant, not yet uploaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Document {
    pub fn new(file_name: &str, content_type: &str, bytes: &[u8]) -> Self {
        Self {
            file_name: file_name.to_string(),
            content_type: content_type.to_string(),
            bytes: bytes.to_vec(),
        }
    }

    pub fn extension(&self) -> &str {
        self.file_name.rsplit_once('.').map_or("bin", |(_, ext)| ext)
    }
}

#[derive(Debug, Default, Clone)]
pub struct AdhesionDetails {
    full_name: Option<String>,
    email: Option<String>,
    documents: Vec<(DocumentKind, Document)>,
    signed: bool,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct Adhesion {
    #[n(0)]
    pub user_id: UserId,
    #[n(1)]
    pub full_name: String,
    #[n(2)]
    pub email: String,
    #[n(3)]
    pub document_urls: Vec<String>,
    #[n(4)]
    pub contract_url: String,
    #[n(5)]
    pub validated: bool,
    #[n(6)]
    pub submitted_at: TimeStamp<Utc>,
}

impl AdhesionDetails {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set_applicant(mut self, full_name: &str, email: &str) -> Self {
        self.full_name = Some(full_name.to_string());
        self.email = Some(email.to_string());
        self
    }
    pub fn add_document(mut self, kind: DocumentKind, document: Document) -> Self {
        self.documents.push((kind, document));
        self
    }
    pub fn sign(mut self) -> Self {
        self.signed = true;
        self
    }

    /// Checks the application is complete. Passport and housing papers are mandatory.
    pub(crate) fn validate(self) -> Result<SignedApplication, ValidationError> {
        let full_name = non_empty(self.full_name, "Full name")?.trim().to_string();
        let email = non_empty(self.email, "Email")?.trim().to_string();
        for (kind, field) in [
            (DocumentKind::Passport, "Passport document"),
            (DocumentKind::Housing, "Housing document"),
        ] {
            if !self.documents.iter().any(|(k, _)| *k == kind) {
                return Err(ValidationError::MissingField(field));
            }
        }
        if !self.signed {
            return Err(ValidationError::MissingField("Contract signature"));
        }
        Ok(SignedApplication {
            full_name,
            email,
            documents: self.documents,
        })
    }
}

pub(crate) struct SignedApplication {
    pub full_name: String,
    pub email: String,
    pub documents: Vec<(DocumentKind, Document)>,
}

impl SignedApplication {
    /// Upload paths, numbered per kind: `passport`, `passport(2)`, ...
    pub fn upload_paths(&self, user_id: &str) -> Vec<String> {
        let mut seen: Vec<DocumentKind> = Vec::new();
        self.documents
            .iter()
            .map(|(kind, doc)| {
                seen.push(*kind);
                let nth = seen.iter().filter(|k| *k == kind).count();
                let name = match nth {
                    1 => kind.folder().to_string(),
                    n => format!("{}({n})", kind.folder()),
                };
                format!("adhesions/{user_id}/{name}.{}", doc.extension())
            })
            .collect()
    }

    pub fn contract(&self, signed_at: &TimeStamp<Utc>) -> String {
        format!(
            "GP EXPRESS MEMBERSHIP CONTRACT\n\n{CONTRACT_TERMS}\n\nSigned by: {} ({})\nDate: {}\n",
            self.full_name,
            self.email,
            signed_at.to_datetime_utc().to_rfc3339()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pdf(name: &str) -> Document {
        Document::new(name, "application/pdf", b"%PDF-1.7")
    }

    fn complete() -> AdhesionDetails {
        AdhesionDetails::new()
            .set_applicant("Awa Diop", "awa@example.com")
            .add_document(DocumentKind::Passport, pdf("passport.pdf"))
            .add_document(DocumentKind::Housing, pdf("bill.pdf"))
            .add_document(DocumentKind::Housing, Document::new("lease.jpg", "image/jpeg", b"jpg"))
    }

    #[test]
    fn unsigned_application_rejected() {
        let err = complete().validate().err().unwrap();
        assert_eq!(err, ValidationError::MissingField("Contract signature"));
    }

    #[test]
    fn housing_papers_required() {
        let err = AdhesionDetails::new()
            .set_applicant("Awa Diop", "awa@example.com")
            .add_document(DocumentKind::Passport, pdf("passport.pdf"))
            .sign()
            .validate()
            .err()
            .unwrap();
        assert_eq!(err, ValidationError::MissingField("Housing document"));
    }

    #[test]
    fn repeated_kinds_are_numbered() {
        let application = complete().sign().validate().ok().unwrap();
        assert_eq!(
            application.upload_paths("user_1"),
            vec![
                "adhesions/user_1/passport.pdf",
                "adhesions/user_1/housing.pdf",
                "adhesions/user_1/housing(2).jpg",
            ]
        );
    }
}
