use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Threshold overrides for the rule engine, read from a remote
/// configuration document. Keys are the product's Spanish names;
/// missing or malformed keys fall back to the defaults key by key, so
/// parsing is total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertThresholds {
    pub rendimiento_critico: f64,
    pub rendimiento_bajo: f64,
    pub rendimiento_excelente: f64,
    pub asistencia_critica: f64,
    pub asistencia_baja: f64,
    pub max_ausencias_criticas: u32,
    pub max_ausencias_bajas: u32,
    pub tendencia_negativa_minima: f64,
    pub mejora_significativa: f64,
    pub materias_en_riesgo_minimas: usize,
    pub dias_analisis_rendimiento: i64,
    pub frecuencia_revision_alertas: i64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            rendimiento_critico: 5.0,
            rendimiento_bajo: 6.0,
            rendimiento_excelente: 9.0,
            asistencia_critica: 70.0,
            asistencia_baja: 80.0,
            max_ausencias_criticas: 5,
            max_ausencias_bajas: 3,
            tendencia_negativa_minima: 1.0,
            mejora_significativa: 1.0,
            materias_en_riesgo_minimas: 2,
            dias_analisis_rendimiento: 30,
            frecuencia_revision_alertas: 24,
        }
    }
}

fn f64_key(doc: &Value, key: &str, fallback: f64) -> f64 {
    doc.get(key).and_then(Value::as_f64).unwrap_or(fallback)
}

fn u32_key(doc: &Value, key: &str, fallback: u32) -> u32 {
    doc.get(key)
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(fallback)
}

fn i64_key(doc: &Value, key: &str, fallback: i64) -> i64 {
    doc.get(key).and_then(Value::as_i64).unwrap_or(fallback)
}

impl AlertThresholds {
    /// Reads overrides from a configuration document. Unknown keys are
    /// ignored; anything missing or non-numeric keeps its default.
    pub fn from_document(doc: &Value) -> Self {
        let d = Self::default();
        Self {
            rendimiento_critico: f64_key(doc, "rendimientoCritico", d.rendimiento_critico),
            rendimiento_bajo: f64_key(doc, "rendimientoBajo", d.rendimiento_bajo),
            rendimiento_excelente: f64_key(doc, "rendimientoExcelente", d.rendimiento_excelente),
            asistencia_critica: f64_key(doc, "asistenciaCritica", d.asistencia_critica),
            asistencia_baja: f64_key(doc, "asistenciaBaja", d.asistencia_baja),
            max_ausencias_criticas: u32_key(doc, "maxAusenciasCriticas", d.max_ausencias_criticas),
            max_ausencias_bajas: u32_key(doc, "maxAusenciasBajas", d.max_ausencias_bajas),
            tendencia_negativa_minima: f64_key(
                doc,
                "tendenciaNegativaMinima",
                d.tendencia_negativa_minima,
            ),
            mejora_significativa: f64_key(doc, "mejoraSignificativa", d.mejora_significativa),
            materias_en_riesgo_minimas: doc
                .get("materiasEnRiesgoMinimas")
                .and_then(Value::as_u64)
                .map(|n| n as usize)
                .unwrap_or(d.materias_en_riesgo_minimas),
            dias_analisis_rendimiento: i64_key(
                doc,
                "diasAnalisisRendimiento",
                d.dias_analisis_rendimiento,
            ),
            frecuencia_revision_alertas: i64_key(
                doc,
                "frecuenciaRevisionAlertas",
                d.frecuencia_revision_alertas,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let parsed = AlertThresholds::from_document(&json!({}));
        assert_eq!(parsed, AlertThresholds::default());
    }

    #[test]
    fn overrides_apply_per_key() {
        let parsed = AlertThresholds::from_document(&json!({
            "rendimientoCritico": 4.5,
            "maxAusenciasCriticas": 8,
            "diasAnalisisRendimiento": 14
        }));
        assert_eq!(parsed.rendimiento_critico, 4.5);
        assert_eq!(parsed.max_ausencias_criticas, 8);
        assert_eq!(parsed.dias_analisis_rendimiento, 14);
        assert_eq!(parsed.rendimiento_bajo, 6.0);
    }

    #[test]
    fn malformed_values_fall_back_without_failing() {
        let parsed = AlertThresholds::from_document(&json!({
            "rendimientoCritico": "cinco",
            "maxAusenciasCriticas": -2,
            "asistenciaCritica": null
        }));
        assert_eq!(parsed.rendimiento_critico, 5.0);
        assert_eq!(parsed.max_ausencias_criticas, 5);
        assert_eq!(parsed.asistencia_critica, 70.0);
    }

    #[test]
    fn non_object_documents_degrade_to_defaults() {
        assert_eq!(
            AlertThresholds::from_document(&json!(null)),
            AlertThresholds::default()
        );
        assert_eq!(
            AlertThresholds::from_document(&json!([1, 2])),
            AlertThresholds::default()
        );
    }
}
