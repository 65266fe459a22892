//! Notification message composition.
//!
//! Turns a job outcome plus the owner's identity into the subject and the
//! plain-text and HTML bodies of the notification. Text is Portuguese, the
//! language of the users of the video service.

use std::fmt;

use html_escape::{encode_double_quoted_attribute, encode_text};

use crate::types::{Identity, JobStatus, NotificationRequest, OutboundMessage};

/// Detail shown when a failed job carries no error message.
pub const UNKNOWN_ERROR_DETAIL: &str = "não informado.";

/// Builds the message for a notification.
pub trait MessageComposer: Send + Sync + fmt::Debug {
    /// Composes the outbound message. Never fails.
    fn compose(&self, request: &NotificationRequest, identity: &Identity) -> OutboundMessage;
}

/// The stock success/failure templates.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultComposer;

impl DefaultComposer {
    /// Creates the composer.
    pub fn new() -> Self {
        Self
    }

    fn success(request: &NotificationRequest, name: &str) -> (String, String, String) {
        let job_id = &request.job_id;
        let video_url = non_empty(request.video_url.as_deref());

        let subject = format!("Seu vídeo foi processado (#{job_id})");

        let link_text = video_url
            .map(|url| format!("Link: {url}\n"))
            .unwrap_or_default();
        let text = format!(
            "Olá, {name}!\n\n\
             Seu vídeo (job {job_id}) foi processado com sucesso.\n\
             {link_text}\n\
             Obrigado por usar nosso serviço."
        );

        let html_link = video_url
            .map(|url| {
                format!(
                    "<p><a href=\"{}\">Abrir vídeo</a></p>",
                    encode_double_quoted_attribute(url)
                )
            })
            .unwrap_or_default();
        let html = format!(
            "<p>Olá, <strong>{}</strong>!</p>\
             <p>Seu vídeo (job <strong>{}</strong>) foi processado com sucesso.</p>\
             {html_link}\
             <p>Obrigado por usar nosso serviço.</p>",
            encode_text(name),
            encode_text(job_id),
        );

        (subject, text, html)
    }

    fn failure(request: &NotificationRequest, name: &str) -> (String, String, String) {
        let job_id = &request.job_id;
        let detail = non_empty(request.error_message.as_deref()).unwrap_or(UNKNOWN_ERROR_DETAIL);

        let subject = format!("Falha ao processar seu vídeo (#{job_id})");

        let text = format!(
            "Olá, {name}!\n\n\
             Ocorreu um erro ao processar seu vídeo (job {job_id}).\n\
             Detalhes: {detail}\n\n\
             Tente novamente mais tarde."
        );

        let html = format!(
            "<p>Olá, <strong>{}</strong>!</p>\
             <p><strong>Falha</strong> ao processar seu vídeo (job <strong>{}</strong>).</p>\
             <p>Detalhes: {}</p>\
             <p>Tente novamente mais tarde.</p>",
            encode_text(name),
            encode_text(job_id),
            encode_text(detail),
        );

        (subject, text, html)
    }
}

impl MessageComposer for DefaultComposer {
    fn compose(&self, request: &NotificationRequest, identity: &Identity) -> OutboundMessage {
        let (subject, text, html) = match request.status {
            JobStatus::Success => Self::success(request, &identity.name),
            JobStatus::Error => Self::failure(request, &identity.name),
        };

        OutboundMessage {
            recipient: identity.email.clone(),
            subject,
            text_body: text.trim().to_string(),
            html_body: html.trim().to_string(),
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            email: "u@example.com".to_string(),
            name: "Mateus".to_string(),
        }
    }

    fn request(status: JobStatus) -> NotificationRequest {
        NotificationRequest {
            job_id: "42".to_string(),
            status,
            user_id: 7,
            video_url: None,
            error_message: None,
        }
    }

    #[test]
    fn test_success_with_link() {
        let mut req = request(JobStatus::Success);
        req.video_url = Some("http://cdn/v.mp4".to_string());

        let msg = DefaultComposer.compose(&req, &identity());

        assert_eq!(msg.recipient, "u@example.com");
        assert_eq!(msg.subject, "Seu vídeo foi processado (#42)");
        assert_eq!(
            msg.text_body,
            "Olá, Mateus!\n\nSeu vídeo (job 42) foi processado com sucesso.\nLink: http://cdn/v.mp4\n\nObrigado por usar nosso serviço."
        );
        assert_eq!(
            msg.html_body,
            "<p>Olá, <strong>Mateus</strong>!</p>\
             <p>Seu vídeo (job <strong>42</strong>) foi processado com sucesso.</p>\
             <p><a href=\"http://cdn/v.mp4\">Abrir vídeo</a></p>\
             <p>Obrigado por usar nosso serviço.</p>"
        );
    }

    #[test]
    fn test_success_without_link() {
        let mut req = request(JobStatus::Success);
        req.video_url = Some(String::new());

        let msg = DefaultComposer.compose(&req, &identity());

        assert_eq!(
            msg.text_body,
            "Olá, Mateus!\n\nSeu vídeo (job 42) foi processado com sucesso.\n\nObrigado por usar nosso serviço."
        );
        assert!(!msg.html_body.contains("<a "));
    }

    #[test]
    fn test_failure_with_detail() {
        let mut req = request(JobStatus::Error);
        req.error_message = Some("codec não suportado".to_string());

        let msg = DefaultComposer.compose(&req, &identity());

        assert_eq!(msg.subject, "Falha ao processar seu vídeo (#42)");
        assert_eq!(
            msg.text_body,
            "Olá, Mateus!\n\nOcorreu um erro ao processar seu vídeo (job 42).\nDetalhes: codec não suportado\n\nTente novamente mais tarde."
        );
        assert!(msg.html_body.contains("<p>Detalhes: codec não suportado</p>"));
        assert!(msg.html_body.starts_with("<p>Olá, <strong>Mateus</strong>!</p><p><strong>Falha</strong>"));
    }

    #[test]
    fn test_failure_without_detail() {
        let msg = DefaultComposer.compose(&request(JobStatus::Error), &identity());
        assert!(msg.text_body.contains("Detalhes: não informado."));
    }

    #[test]
    fn test_html_is_escaped() {
        let mut req = request(JobStatus::Error);
        req.job_id = "<b>1</b>".to_string();
        req.error_message = Some("a < b & c".to_string());
        let who = Identity {
            email: "x@example.com".to_string(),
            name: "<script>".to_string(),
        };

        let msg = DefaultComposer.compose(&req, &who);

        assert!(msg.html_body.contains("&lt;script&gt;"));
        assert!(msg.html_body.contains("&lt;b&gt;1&lt;/b&gt;"));
        assert!(msg.html_body.contains("a &lt; b &amp; c"));
        assert!(msg.text_body.contains("<script>"));
    }

    #[test]
    fn test_link_attribute_is_escaped() {
        let mut req = request(JobStatus::Success);
        req.video_url = Some("http://cdn/v.mp4?a=1&b=\"2\"".to_string());

        let msg = DefaultComposer.compose(&req, &identity());

        assert!(msg.html_body.contains("href=\"http://cdn/v.mp4?a=1&amp;b=&quot;2&quot;\""));
    }
}
