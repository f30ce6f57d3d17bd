use tracing::debug;

use crate::domain::{BusinessDomainId, Message, MessageDirection};
use crate::error::{ConnectorError, Result};
use crate::storage::Storage;

/// Find the business message an evidence refers to.
///
/// `ref_to_message_id` is tried first, as ebms id and then as backend id of
/// a message in `direction`. Only if that gives nothing is
/// `ref_to_backend_message_id` tried. Partners fill one or the other.
pub async fn find_business_message(
    storage: &dyn Storage,
    tenant: &BusinessDomainId,
    reference: &Message,
    direction: MessageDirection,
) -> Result<Message> {
    let details = &reference.details;

    if let Some(ref_id) = non_empty(details.ref_to_message_id.as_deref()) {
        if let Some(found) = storage.find_message_by_ebms_id(tenant, ref_id, direction).await? {
            debug!(tenant = %tenant, ref_to_message_id = ref_id, "Business message found by ebms id");
            return Ok(found);
        }
        if let Some(found) = storage.find_message_by_backend_id(tenant, ref_id, direction).await? {
            debug!(tenant = %tenant, ref_to_message_id = ref_id, "Business message found by backend id");
            return Ok(found);
        }
    }

    if let Some(ref_id) = non_empty(details.ref_to_backend_message_id.as_deref()) {
        if let Some(found) = storage.find_message_by_backend_id(tenant, ref_id, direction).await? {
            debug!(
                tenant = %tenant,
                ref_to_backend_message_id = ref_id,
                "Business message found by backend reference"
            );
            return Ok(found);
        }
    }

    Err(ConnectorError::RelatedMessageNotFound {
        ref_to_message_id: details.ref_to_message_id.clone(),
        ref_to_backend_message_id: details.ref_to_backend_message_id.clone(),
        direction,
    })
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
