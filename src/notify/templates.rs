//! Subjects and HTML bodies for outgoing mail.

pub struct Message {
    pub subject: String,
    pub html: String,
}

fn plan_display_name(plan: &str) -> &str {
    match plan.to_ascii_lowercase().as_str() {
        "trial" => "Free trial (15 days)",
        "monthly" | "mensal" => "Monthly",
        "quarterly" | "trimestral" => "Quarterly",
        "semiannual" | "semestral" => "Semiannual",
        "annual" | "anual" => "Annual",
        "admin" => "Administrator",
        _ => plan,
    }
}

/// Escapes text for use in HTML element content and quoted attributes.
fn escape_html(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

fn layout(title: &str, body: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="UTF-8"><title>{title}</title></head>
<body style="margin:0;padding:40px 20px;background:#212224;font-family:'Segoe UI',sans-serif;color:#e2e8f0;">
<table width="600" cellpadding="0" cellspacing="0" align="center" style="background:#3a3a3a;border-radius:20px;max-width:100%;">
<tr><td style="padding:40px;">{body}</td></tr>
<tr><td style="padding:20px 40px;color:#64748b;font-size:12px;text-align:center;">
This is an automated message from Eden Map. Please do not reply.
</td></tr>
</table>
</body>
</html>"#
    )
}

pub fn welcome(login: &str, email: &str, plan: &str) -> Message {
    let login = escape_html(login);
    let email = escape_html(email);
    let body = format!(
        r#"<h1 style="color:#ffffff;">Welcome, {login}!</h1>
<p>Your Eden Map account has been created.</p>
<table cellpadding="6">
<tr><td>Login:</td><td><strong>{login}</strong></td></tr>
<tr><td>Email:</td><td><strong>{email}</strong></td></tr>
<tr><td>Plan:</td><td><strong>{plan}</strong></td></tr>
</table>
<p>Keep your credentials safe and never share them with anyone.</p>"#,
        plan = escape_html(plan_display_name(plan)),
    );
    Message {
        subject: "Welcome to Eden Map!".into(),
        html: layout("Welcome to Eden Map", &body),
    }
}

pub fn recovery_code(login: &str, code: &str, ttl_minutes: i64) -> Message {
    let login = escape_html(login);
    let digits: String = code
        .chars()
        .map(|d| escape_html(&d.to_string()))
        .map(|d| {
            format!(
                r#"<span style="display:inline-block;margin:0 6px;padding:12px 18px;background:#8a4aed;border-radius:10px;font-size:32px;font-weight:700;color:#ffffff;">{d}</span>"#
            )
        })
        .collect();
    let body = format!(
        r#"<h1 style="color:#ffffff;">Password recovery</h1>
<p>Hello <strong>{login}</strong>, use the code below to reset your password.</p>
<p style="text-align:center;">{digits}</p>
<p>The code expires in {ttl_minutes} minutes. If you did not ask for it, ignore this email.</p>"#
    );
    Message {
        subject: "Your Eden Map password recovery code".into(),
        html: layout("Eden Map - Password recovery", &body),
    }
}
