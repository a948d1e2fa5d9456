//! Scripted transport for exercising the client without a network.

use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;

use crate::PortalError;
use crate::transport::{PortalRequest, PortalResponse, Transport};

struct Route {
    fragment: String,
    responses: VecDeque<PortalResponse>,
}

/// Answers requests from routes matched by URL substring, in insertion order.
///
/// Each route replays its responses in sequence and then repeats the last
/// one. Unmatched requests get a 404. Every request is logged.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<Route>>,
    log: Mutex<Vec<PortalRequest>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, fragment: &str, status: u16, body: &str) -> Self {
        self.route_seq(fragment, vec![PortalResponse::new(status, body)])
    }

    pub fn route_seq(self, fragment: &str, responses: Vec<PortalResponse>) -> Self {
        self.routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Route {
                fragment: fragment.to_string(),
                responses: responses.into(),
            });
        self
    }

    pub fn requests(&self) -> Vec<PortalRequest> {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count_matching(&self, fragment: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.url.contains(fragment))
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn execute(&self, request: PortalRequest) -> Result<PortalResponse, PortalError> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(route) = routes
            .iter_mut()
            .find(|r| request.url.contains(&r.fragment))
        else {
            return Ok(PortalResponse::new(404, ""));
        };
        let response = if route.responses.len() > 1 {
            route.responses.pop_front()
        } else {
            route.responses.front().cloned()
        };
        Ok(response.unwrap_or_else(|| PortalResponse::new(404, "")))
    }
}

// ── Fixtures ──

pub const PORTAL: &str = "http://portal.test/wps";

pub fn config() -> cadex_core::PortalConfig {
    cadex_core::PortalConfig {
        portal_url: PORTAL.into(),
        origin: "http://portal.test".into(),
        api_url: "http://portal.test/api/online".into(),
        connect_retry_ms: 10,
        enrich: None,
        ..cadex_core::PortalConfig::default()
    }
}

/// Landing page carrying the session markers, subjects and street types.
pub fn landing_page() -> String {
    format!(
        r#"<html><head><base href="{PORTAL}/portal/p/cc_ib_portal_services/online_request/!ut/p/z1/04_Sj9/"></head>
<body>
<script>jQuery('#captchaImage2').attr('src', 'captcha.png?refresh=true');</script>
<form action="p0/IZ7_01HA1A42KODT90AR30VLN22003=CZ6_GQ4E1C41KGQ170AIAK131G00T5=MEcontroller!QCPSearchAction==/" method="post">
<input type="radio" name="search_type" value="ADDRESS" checked="checked">
<select id="oSubjectId" name="subject_id">
  <option value="">Выберите субъект</option>
  <option value="145000000000">Москва</option>
  <option value="101000000000">Алтайский край</option>
</select>
<select name="street_type">
  <option value="str0">Не выбрано</option>
  <option value="str1">Улица</option>
  <option value="str2">Проспект</option>
</select>
</form>
</body></html>"#
    )
}

/// Results page holding `cad_numbers` rows plus `empty_rows` separator rows.
pub fn results_page(total: usize, cad_numbers: &[&str], empty_rows: usize) -> String {
    let mut rows = String::new();
    for (i, cad) in cad_numbers.iter().enumerate() {
        rows.push_str(&format!(
            r#"<tr id="js_oTr{i}"><td><a href="?dbName=firLite&amp;objectId={i}">  обл. Московская,
              г. Химки,&nbsp;ул. Лесная, д. {i}</a></td><td><nobr>{cad}</nobr></td></tr>"#
        ));
    }
    for i in 0..empty_rows {
        rows.push_str(&format!(
            r#"<tr id="js_oTr_sep{i}"><td><a href="?x">-</a></td><td></td></tr>"#
        ));
    }
    format!(
        r#"<html><body>
<table><tr><td class="infomsg1"><span class="t12">Найдено {total} объектов</span></td></tr></table>
<div id="pg_stats">Всего: {total}</div>
<table class="brdw1111">{rows}</table>
<div class="asa.portlet.id" style="display:none">PC_7_015A1H40I80TC0A2KT3JOM1000</div>
</body></html>"#
    )
}
