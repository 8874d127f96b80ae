/*!
# MykiOp DevKit - Stubs et utilitaires de test

Bibliothèque facilitant les tests de l'agent MykiOp avec:
- Stubs en mémoire du store distant, de la télémétrie et de la sonde réseau
- Horloge manuelle et enregistreur vidéo scripté
- Harness montant un coordinator complet sur un répertoire temporaire
*/

pub mod remote_stub;
pub mod test_utils;

pub use remote_stub::{MemoryRemote, RecordingTelemetry, ToggleProbe, UploadedObject};
pub use test_utils::{init_test_logging, ManualClock, ScriptedMedia, TestHarness, TEST_DEVICE};
